use serde::Serialize;

/// One `ID: text` line from a host command's stderr
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostMessage {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostMessages {
    pub messages: Vec<HostMessage>,
}

impl HostMessages {
    pub fn find_id(&self, id: &str) -> Option<&HostMessage> {
        self.messages.iter().find(|m| m.id == id)
    }
}

/// Split diagnostic output into messages. Lines without a colon keep the
/// whole line as text and an empty id.
pub fn parse_messages(output: &str) -> HostMessages {
    let messages = output
        .split('\n')
        .map(|line| match line.find(':') {
            Some(index) => HostMessage {
                id: line[..index].trim().to_string(),
                text: line[index + 1..].trim().to_string(),
            },
            None => HostMessage {
                id: String::new(),
                text: line.trim().to_string(),
            },
        })
        .collect();

    HostMessages { messages }
}

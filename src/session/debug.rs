use crate::command::CommandChannel;
use crate::error::AppResult;
use std::collections::BTreeMap;

pub const DEBUG_CONFIG_FILE: &str = "/QIBM/ProdData/IBMiDebugService/bin/DebugService.env";
pub const SERVICE_CERTIFICATE: &str = "debug_service.pfx";

#[derive(Debug, Clone, PartialEq, Eq)]
struct ConfigLine {
    key: String,
    value: Option<String>,
}

/// `DebugService.env` of the debug service, kept line by line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugConfig {
    lines: Vec<ConfigLine>,
}

impl DebugConfig {
    /// Comments, blank lines and lines without `=` are kept without a value
    pub fn parse(content: &str) -> Self {
        let lines = content
            .split('\n')
            .map(str::trim)
            .map(|line| match line.find('=') {
                Some(position) if !line.starts_with('#') => ConfigLine {
                    key: line[..position].to_string(),
                    value: Some(line[position + 1..].to_string()),
                },
                _ => ConfigLine {
                    key: line.to_string(),
                    value: None,
                },
            })
            .collect();
        Self { lines }
    }

    pub fn load(channel: &CommandChannel) -> AppResult<Self> {
        Ok(Self::parse(&channel.read_text(DEBUG_CONFIG_FILE)?))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines
            .iter()
            .find(|line| line.key == key && line.value.is_some())
            .and_then(|line| line.value.as_deref())
    }

    /// Empty values fall back to the default too
    pub fn get_or_default(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Some(value) if !value.is_empty() => value.to_string(),
            _ => default.to_string(),
        }
    }

    pub fn service_root(&self) -> String {
        self.get_or_default("DBGSRV_ROOT", "/QIBM/ProdData/IBMiDebugService")
    }

    pub fn service_bin(&self) -> String {
        format!("{}/bin", self.service_root())
    }

    pub fn service_work_dir(&self) -> String {
        self.get_or_default("DBGSRV_WRK_DIR", "/QIBM/UserData/IBMiDebugService")
    }

    pub fn service_certificate_path(&self) -> String {
        self.get_or_default(
            "DEBUG_SERVICE_KEYSTORE_FILE",
            &format!("{}/certs/{}", self.service_work_dir(), SERVICE_CERTIFICATE),
        )
    }

    pub fn client_certificate_path(&self) -> String {
        self.service_certificate_path().replace(".pfx", ".crt")
    }

    pub fn service_workspace(&self) -> String {
        self.get_or_default("STR_DBGSVR_WRK_ROOT_DIR", "$DBGSRV_WRK_DIR/startDebugService_workspace")
            .replace("$DBGSRV_WRK_DIR", &self.service_work_dir())
    }

    /// Key/value pairs for the discovery cache
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.lines
            .iter()
            .filter_map(|line| line.value.clone().map(|value| (line.key.clone(), value)))
            .collect()
    }

    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        Self {
            lines: map
                .iter()
                .map(|(key, value)| ConfigLine {
                    key: key.clone(),
                    value: Some(value.clone()),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "# Debug service\nDBGSRV_WRK_DIR=/QIBM/UserData/Dbg\nJAVA_HOME=\n  STR_DBGSVR_WRK_ROOT_DIR=$DBGSRV_WRK_DIR/ws  \nnot a pair\n";

    #[test]
    fn test_parse_and_defaults() {
        let config = DebugConfig::parse(SAMPLE);
        assert_eq!(config.get("DBGSRV_WRK_DIR"), Some("/QIBM/UserData/Dbg"));
        assert_eq!(config.get("JAVA_HOME"), Some(""));
        assert_eq!(config.get("# Debug service"), None);
        assert_eq!(config.get("not a pair"), None);

        assert_eq!(config.service_root(), "/QIBM/ProdData/IBMiDebugService");
        assert_eq!(config.service_bin(), "/QIBM/ProdData/IBMiDebugService/bin");
        assert_eq!(config.service_workspace(), "/QIBM/UserData/Dbg/ws");
        assert_eq!(config.service_certificate_path(), "/QIBM/UserData/Dbg/certs/debug_service.pfx");
        assert_eq!(config.client_certificate_path(), "/QIBM/UserData/Dbg/certs/debug_service.crt");
    }

    #[test]
    fn test_cache_map() {
        let config = DebugConfig::parse(SAMPLE);
        let map = config.to_map();
        assert_eq!(map.len(), 3);
        let restored = DebugConfig::from_map(&map);
        assert_eq!(restored.service_workspace(), config.service_workspace());
    }
}

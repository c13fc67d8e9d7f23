use crate::command::{CommandChannel, CommandData};
use crate::error::AppResult;
use crate::sql::DB2_FEATURE;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const DEBUG_SERVICE_FEATURE: &str = "startDebugService.sh";

const JAVA_ROOT: &str = "/QOpenSys/QIBM/ProdData/JavaVM";
const JDKS: &[&str] = &["jdk80", "jdk11", "jdk17"];

/// Directory listed to find a set of tools
struct Candidate {
    path: &'static str,
    /// Listed instead of the whole directory; names then match by substring
    specific: Option<&'static str>,
    names: &'static [&'static str],
}

const CANDIDATES: &[Candidate] = &[
    Candidate {
        path: "/usr/bin/",
        specific: None,
        names: &["setccsid", "iconv", "attr", "tar", "ls"],
    },
    Candidate {
        path: "/QOpenSys/pkgs/bin/",
        specific: None,
        names: &["git", "grep", "tn5250", "md5sum", "bash", "chsh", "stat", "sort", "tar", "ls"],
    },
    Candidate {
        path: "/QSYS.LIB/",
        specific: Some(DB2_FEATURE),
        names: &[DB2_FEATURE],
    },
    Candidate {
        path: "/QIBM/ProdData/IBMiDebugService/bin/",
        specific: Some(DEBUG_SERVICE_FEATURE),
        names: &[DEBUG_SERVICE_FEATURE],
    },
];

/// Tool name to absolute path, `None` when the tool was not found.
///
/// Every expected name is present as a key, so the sorted key list works as
/// a fingerprint of the feature set a cached table was built for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteFeatureTable(BTreeMap<String, Option<String>>);

impl RemoteFeatureTable {
    /// Every feature this crate probes for, none found yet
    pub fn expected() -> Self {
        let mut table = Self::default();
        for candidate in CANDIDATES {
            for name in candidate.names {
                table.set(name, None);
            }
        }
        for name in JDKS {
            table.set(name, None);
        }
        table
    }

    pub fn set(&mut self, name: &str, path: Option<String>) {
        self.0.insert(name.to_string(), path);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|path| path.as_deref())
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn fingerprint(&self) -> String {
        self.0.keys().cloned().collect::<Vec<_>>().join(",")
    }

    /// Take over the paths of `other` for the keys both tables know
    pub fn merge(&mut self, other: &RemoteFeatureTable) {
        for (name, path) in self.0.iter_mut() {
            if let Some(found) = other.0.get(name) {
                *path = found.clone();
            }
        }
    }

    pub fn found(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .filter_map(|(name, path)| path.as_deref().map(|path| (name.as_str(), path)))
    }
}

/// Probe the candidate directories and the JDK roots
pub fn probe_features(channel: &CommandChannel) -> RemoteFeatureTable {
    let mut table = RemoteFeatureTable::expected();

    for candidate in CANDIDATES {
        let command = format!("ls -p {}{}", candidate.path, candidate.specific.unwrap_or(""));
        match channel.send_command(&CommandData::new(command)) {
            Ok(result) if !result.stdout.is_empty() => apply_listing(&mut table, candidate, &result.stdout),
            Ok(_) => debug!("Nothing found in {}", candidate.path),
            Err(e) => warn!("Could not list {}: {}", candidate.path, e),
        }
    }

    for name in JDKS {
        let home = format!("{}/{}/64bit", JAVA_ROOT, name);
        match channel.send_command(&CommandData::new(format!("test -d {}", home))) {
            Ok(result) if result.code == 0 => table.set(name, Some(home)),
            Ok(_) => {}
            Err(e) => warn!("Could not check {}: {}", home, e),
        }
    }

    table
}

fn apply_listing(table: &mut RemoteFeatureTable, candidate: &Candidate, stdout: &str) {
    let files: Vec<&str> = stdout.split('\n').map(str::trim).collect();

    for name in candidate.names {
        if candidate.specific.is_some() {
            if let Some(file) = files.iter().find(|file| file.contains(name)) {
                table.set(name, Some(file.to_string()));
            }
        } else if files.contains(name) {
            table.set(name, Some(format!("{}{}", candidate.path, name)));
        }
    }
}

/// `uname -rv` prints release then version (`4 7`); the OS level is `7.4`
pub fn parse_os_version(uname: &str) -> Option<String> {
    let mut parts = uname.split_whitespace();
    let release = parts.next()?;
    let version = parts.next()?;
    Some(format!("{}.{}", version, release))
}

pub fn probe_os_version(channel: &CommandChannel) -> AppResult<Option<String>> {
    let result = channel.send_command(&CommandData::new("uname -rv"))?;
    Ok(if result.code == 0 {
        parse_os_version(&result.stdout)
    } else {
        None
    })
}

/// Compare dotted versions numerically, `7.3 < 7.4`
pub fn version_below(version: &str, minimum: &str) -> bool {
    let parse = |text: &str| -> Vec<u32> { text.split('.').filter_map(|part| part.trim().parse().ok()).collect() };
    parse(version) < parse(minimum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ShellContext;
    use crate::ssh::testing::ScriptedTransport;

    #[test]
    fn test_fingerprint_is_sorted_keys() {
        let mut table = RemoteFeatureTable::default();
        table.set("tar", None);
        table.set("bash", Some("/QOpenSys/pkgs/bin/bash".to_string()));
        assert_eq!(table.fingerprint(), "bash,tar");
        assert!(RemoteFeatureTable::expected().fingerprint().contains("QZDFMDB2.PGM"));
    }

    #[test]
    fn test_merge_keeps_only_known_keys() {
        let mut table = RemoteFeatureTable::expected();
        let mut cached = RemoteFeatureTable::default();
        cached.set("git", Some("/QOpenSys/pkgs/bin/git".to_string()));
        cached.set("retired", Some("/x".to_string()));

        table.merge(&cached);
        assert_eq!(table.get("git"), Some("/QOpenSys/pkgs/bin/git"));
        assert_eq!(table.get("retired"), None);
        assert_eq!(table.fingerprint(), RemoteFeatureTable::expected().fingerprint());
    }

    #[test]
    fn test_probe_features() {
        let transport = ScriptedTransport::new();
        transport
            .on("ls -p /usr/bin/", 0, "attr\niconv\nsetccsid2\n", "")
            .on("ls -p /QOpenSys/pkgs/bin/", 0, "bash\ngit\nbin/", "")
            .on("ls -p /QSYS.LIB/QZDFMDB2.PGM", 0, "/QSYS.LIB/QZDFMDB2.PGM", "")
            .on("ls -p /QIBM/ProdData", 2, "", "ls: not found")
            .on("test -d /QOpenSys/QIBM/ProdData/JavaVM/jdk", 1, "", "")
            .on("test -d /QOpenSys/QIBM/ProdData/JavaVM/jdk11", 0, "", "");
        let channel = CommandChannel::new(transport, ShellContext::default(), None);

        let table = probe_features(&channel);
        assert_eq!(table.get("attr"), Some("/usr/bin/attr"));
        assert_eq!(table.get("setccsid"), None);
        assert_eq!(table.get("bash"), Some("/QOpenSys/pkgs/bin/bash"));
        assert_eq!(table.get(DB2_FEATURE), Some("/QSYS.LIB/QZDFMDB2.PGM"));
        assert!(!table.has(DEBUG_SERVICE_FEATURE));
        assert_eq!(table.get("jdk11"), Some("/QOpenSys/QIBM/ProdData/JavaVM/jdk11/64bit"));
        assert!(!table.has("jdk17"));
    }

    #[test]
    fn test_os_version() {
        assert_eq!(parse_os_version("4 7"), Some("7.4".to_string()));
        assert_eq!(parse_os_version("garbage"), None);
        assert!(version_below("7.3", "7.4"));
        assert!(!version_below("7.5", "7.4"));
        assert!(!version_below("7.4", "7.4"));

        let transport = ScriptedTransport::new();
        transport.on("uname -rv", 0, "5 7\n", "");
        let channel = CommandChannel::new(transport, ShellContext::default(), None);
        assert_eq!(probe_os_version(&channel).unwrap(), Some("7.5".to_string()));
    }
}

use serde::{Deserialize, Serialize};

/// Job runs without conversion (binary)
pub const CCSID_NOCONVERSION: i32 = 65535;
/// User profile defers to the QCCSID system value
pub const CCSID_SYSVAL: i32 = -2;

/// CCSIDs negotiated during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CcsidInfo {
    pub qccsid: i32,
    pub job_ccsid: i32,
    pub user_default_ccsid: i32,
    pub sshd_ccsid: Option<i32>,
}

/// Effective encoding for data exchanged with the job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingDetail {
    /// The user default CCSID replaced an unusable job CCSID
    pub fallback: bool,
    pub ccsid: i32,
    pub invalid: bool,
}

fn unusable(ccsid: i32) -> bool {
    ccsid < 1 || ccsid == CCSID_NOCONVERSION
}

impl CcsidInfo {
    pub fn encoding(&self) -> EncodingDetail {
        let fallback = unusable(self.job_ccsid) && self.user_default_ccsid > 0;
        let ccsid = if fallback {
            self.user_default_ccsid
        } else {
            self.job_ccsid
        };

        EncodingDetail {
            fallback,
            ccsid,
            invalid: unusable(ccsid),
        }
    }

    pub fn ccsid(&self) -> i32 {
        self.encoding().ccsid
    }

    /// CCSID to force on the database job, when the job itself runs unconverted
    pub fn job_fix_ccsid(&self) -> Option<i32> {
        let detail = self.encoding();
        if detail.fallback && !detail.invalid {
            Some(detail.ccsid)
        } else {
            None
        }
    }

    /// Shell text needs variant translation when it is not routed through the
    /// fast shell helper and the job CCSID differs from the one sshd runs under.
    pub fn requires_translation(&self, fast_shell_installed: bool) -> bool {
        if fast_shell_installed {
            return false;
        }
        match self.sshd_ccsid {
            Some(sshd) => sshd != self.job_ccsid,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(job: i32, default: i32) -> CcsidInfo {
        CcsidInfo {
            qccsid: 37,
            job_ccsid: job,
            user_default_ccsid: default,
            sshd_ccsid: None,
        }
    }

    #[test]
    fn test_job_ccsid_wins_when_usable() {
        assert_eq!(info(273, 37).ccsid(), 273);
        assert_eq!(info(273, 0).ccsid(), 273);
        assert!(!info(273, 37).encoding().fallback);
    }

    #[test]
    fn test_default_ccsid_replaces_sentinel() {
        let detail = info(CCSID_NOCONVERSION, 297).encoding();
        assert!(detail.fallback);
        assert_eq!(detail.ccsid, 297);
        assert!(!detail.invalid);
        assert_eq!(info(CCSID_NOCONVERSION, 297).job_fix_ccsid(), Some(297));
    }

    #[test]
    fn test_sentinel_without_default_is_invalid() {
        let detail = info(CCSID_NOCONVERSION, 0).encoding();
        assert!(!detail.fallback);
        assert!(detail.invalid);
        assert_eq!(info(CCSID_NOCONVERSION, 0).job_fix_ccsid(), None);
    }

    #[test]
    fn test_requires_translation() {
        let mut ccsids = info(273, 273);
        assert!(!ccsids.requires_translation(false));
        ccsids.sshd_ccsid = Some(37);
        assert!(ccsids.requires_translation(false));
        assert!(!ccsids.requires_translation(true));
        ccsids.sshd_ccsid = Some(273);
        assert!(!ccsids.requires_translation(false));
    }
}

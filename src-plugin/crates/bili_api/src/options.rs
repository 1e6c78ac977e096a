use serde::{Deserialize, Serialize};

/// Everything the resolver needs to know about the caller's account and
/// quality preferences.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ResolveOptions {
    /// `SESSDATA` cookie. Unlocks 720P and above.
    pub sessdata: Option<String>,
    /// `buvid3` cookie, the device identity.
    pub buvid3: Option<String>,
    /// Requested tier, `0` for automatic.
    pub qn: i64,
    /// Reject every tier other than `qn`. Ignored in automatic mode.
    pub qn_strict: bool,
    /// Fail split results that carry no audio track instead of returning video only.
    pub require_audio: bool,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl ResolveOptions {
    pub fn sessdata(&self) -> Option<&str> {
        non_blank(&self.sessdata)
    }

    pub fn buvid3(&self) -> Option<&str> {
        non_blank(&self.buvid3)
    }

    pub fn logged_in(&self) -> bool {
        self.sessdata().is_some()
    }

    pub fn is_strict(&self) -> bool {
        self.qn_strict && self.qn != 0
    }

    /// `SESSDATA=...; buvid3=...`, only when a session credential is set.
    pub fn cookie_header(&self) -> Option<String> {
        let sessdata = self.sessdata()?;
        let mut parts = vec![format!("SESSDATA={sessdata}")];
        if let Some(buvid3) = self.buvid3() {
            parts.push(format!("buvid3={buvid3}"));
        }
        Some(parts.join("; "))
    }
}

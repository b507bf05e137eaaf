use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Evidence {
    Path {
        path: String,
        exists: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
    },
    Command {
        cmdline: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    Stat {
        key: String,
        value: String,
    },
}

impl Evidence {
    pub fn path(path: impl Into<String>, exists: bool, size: Option<u64>) -> Self {
        Evidence::Path {
            path: path.into(),
            exists,
            size,
        }
    }

    pub fn command(cmdline: impl Into<String>, exit_code: Option<i32>) -> Self {
        Evidence::Command {
            cmdline: cmdline.into(),
            exit_code,
        }
    }

    pub fn stat(key: impl Into<String>, value: impl Into<String>) -> Self {
        Evidence::Stat {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn summary(&self) -> String {
        match self {
            Evidence::Path { path, exists, size } => match (exists, size) {
                (false, _) => format!("{path} (missing)"),
                (true, Some(size)) => format!("{path} ({size} bytes)"),
                (true, None) => path.clone(),
            },
            Evidence::Command { cmdline, exit_code } => match exit_code {
                Some(code) => format!("{cmdline} -> exit {code}"),
                None => format!("{cmdline} -> did not run"),
            },
            Evidence::Stat { key, value } => format!("{key}={value}"),
        }
    }
}

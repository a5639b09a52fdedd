use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A drive letter a disk image is mounted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Drive(char);

impl Drive {
    pub fn new(letter: char) -> Result<Self, RuntimeError> {
        if letter.is_ascii_alphabetic() {
            Ok(Self(letter.to_ascii_uppercase()))
        } else {
            Err(RuntimeError::InvalidDrive(letter.to_string()))
        }
    }

    pub fn letter(self) -> char {
        self.0
    }

    /// Root directory of the mounted volume, e.g. `E:\`.
    pub fn root(self) -> PathBuf {
        PathBuf::from(format!("{}:\\", self.0))
    }
}

impl fmt::Display for Drive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.0)
    }
}

impl FromStr for Drive {
    type Err = RuntimeError;

    /// Accepts `E`, `e:`, `E:\` and `E:/`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let rest = trimmed
            .strip_suffix('\\')
            .or_else(|| trimmed.strip_suffix('/'))
            .unwrap_or(trimmed);
        let rest = rest.strip_suffix(':').unwrap_or(rest);
        let mut chars = rest.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Drive::new(c).map_err(|_| RuntimeError::InvalidDrive(s.to_owned())),
            _ => Err(RuntimeError::InvalidDrive(s.to_owned())),
        }
    }
}

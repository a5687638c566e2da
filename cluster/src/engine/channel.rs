use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum channel name length, sigil included.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 50;

/// Prefix every canonical channel name carries.
pub const CHANNEL_SIGIL: char = '#';

/// A channel in its canonical form: lower-case with a leading `#`.
///
/// Every lookup in the cluster goes through this type, so two spellings of the
/// same room (`Foo`, `#foo`) always compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Channel(String);

impl Channel {
    /// Normalize and validate a channel name.
    pub fn parse(name: &str) -> Result<Self, String> {
        let name = normalize_channel_name(name.trim());
        validate_channel_name(&name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name without its sigil, as used by the chatters endpoint.
    pub fn name_without_sigil(&self) -> &str {
        &self.0[CHANNEL_SIGIL.len_utf8()..]
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Channel {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

impl AsRef<str> for Channel {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn normalize_channel_name(name: &str) -> String {
    let name = name.to_lowercase();
    if name.starts_with(CHANNEL_SIGIL) {
        name
    } else {
        format!("{CHANNEL_SIGIL}{name}")
    }
}

/// Validate a normalized channel name. Must be 2-50 chars, no whitespace.
fn validate_channel_name(name: &str) -> Result<(), String> {
    if name.len() < 2 {
        return Err("Channel name too short".into());
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err(format!(
            "Channel name too long (max {} characters)",
            MAX_CHANNEL_NAME_LENGTH
        ));
    }
    if name.chars().any(char::is_whitespace) {
        return Err("Channel name cannot contain spaces".into());
    }
    Ok(())
}

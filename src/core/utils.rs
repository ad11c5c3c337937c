use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Android ABI of the native-library split.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Target {
    #[serde(rename = "armeabi-v7a")]
    ArmV7a,
    #[default]
    #[serde(rename = "arm64-v8a")]
    Arm64V8a,
    #[serde(rename = "x86")]
    X86,
    #[serde(rename = "x86_64")]
    X86_64,
}

impl Target {
    /// Identifier used in the NDK and under `lib/` to refer to the ABI
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Arm64V8a => "arm64-v8a",
            Self::ArmV7a => "armeabi-v7a",
            Self::X86 => "x86",
            Self::X86_64 => "x86_64",
        }
    }

    /// Split name suffix, `config.arm64_v8a` and friends.
    pub fn split_suffix(self) -> &'static str {
        match self {
            Self::Arm64V8a => "arm64_v8a",
            Self::ArmV7a => "armeabi_v7a",
            Self::X86 => "x86",
            Self::X86_64 => "x86_64",
        }
    }

    pub fn host() -> Option<Self> {
        Some(match std::env::consts::ARCH {
            "aarch64" => Self::Arm64V8a,
            "arm" => Self::ArmV7a,
            "x86" => Self::X86,
            "x86_64" => Self::X86_64,
            _ => return None,
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Target {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "arm64-v8a" | "arm64_v8a" | "arm64" => Self::Arm64V8a,
            "armeabi-v7a" | "armeabi_v7a" | "arm" => Self::ArmV7a,
            "x86" => Self::X86,
            "x86_64" | "x64" => Self::X86_64,
            other => anyhow::bail!("unsupported ABI `{other}`"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_spellings() {
        assert_eq!("arm64-v8a".parse::<Target>().unwrap(), Target::Arm64V8a);
        assert_eq!("armeabi_v7a".parse::<Target>().unwrap(), Target::ArmV7a);
        assert!("mips".parse::<Target>().is_err());
    }

    #[test]
    fn split_suffix_uses_underscores() {
        assert_eq!(Target::Arm64V8a.split_suffix(), "arm64_v8a");
        assert_eq!(Target::X86_64.as_str(), "x86_64");
    }
}

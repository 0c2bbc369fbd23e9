//! Model identifier parsing
//!
//! Users address loadable things with short typed identifiers:
//! `p:<name>` for a stored preset, `h:<repo>:<quant>` for a HuggingFace
//! artifact, and `f:<path>` for a file on disk (a preset document when the
//! path ends in `.yaml`/`.yml`, a model file otherwise).
//!
//! Parsing is pure and never touches the filesystem.

use crate::error::{Error, Result};

/// A parsed identifier, retaining the raw input it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    /// The string the identifier was parsed from
    pub raw: String,
    pub kind: Kind,
}

/// The typed variants an identifier can take
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kind {
    /// `p:<name>` — a preset stored in the preset directory
    Preset { name: String },
    /// `h:<repo>:<quant>` — a registry artifact; `quant` may be empty at
    /// parse time (required at use)
    HuggingFace { repo: String, quant: String },
    /// `f:<path>` where the path does not end in `.yaml`/`.yml`
    ModelFile { path: String },
    /// `f:<path>` where the path ends in `.yaml`/`.yml` (case-insensitive)
    PresetFile { path: String },
}

/// Parse an identifier string.
///
/// The shortest valid identifier is three characters (`p:x`); the second
/// byte must be `:`. For `h:` the remainder is split on the first `:` —
/// any further colons stay in the quant verbatim.
pub fn parse(s: &str) -> Result<Identifier> {
    if s.is_empty() {
        return Err(Error::EmptyIdentifier);
    }
    if s.len() < 3 || s.as_bytes()[1] != b':' {
        return Err(Error::InvalidIdentifier(s.to_string()));
    }

    let rest = &s[2..];
    let kind = match &s[..1] {
        "p" => Kind::Preset {
            name: rest.to_string(),
        },
        "h" => match rest.split_once(':') {
            Some((repo, quant)) => Kind::HuggingFace {
                repo: repo.to_string(),
                quant: quant.to_string(),
            },
            None => Kind::HuggingFace {
                repo: rest.to_string(),
                quant: String::new(),
            },
        },
        "f" => {
            let lower = rest.to_ascii_lowercase();
            if lower.ends_with(".yaml") || lower.ends_with(".yml") {
                Kind::PresetFile {
                    path: rest.to_string(),
                }
            } else {
                Kind::ModelFile {
                    path: rest.to_string(),
                }
            }
        }
        _ => return Err(Error::UnknownPrefix(s.to_string())),
    };

    Ok(Identifier {
        raw: s.to_string(),
        kind,
    })
}

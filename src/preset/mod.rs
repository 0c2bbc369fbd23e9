//! Preset documents
//!
//! A preset maps a symbolic name to model artifacts and server arguments.
//! Documents are YAML, validated on load, and resolved (relative `f:` paths
//! rewritten to absolute ones) against the directory of the file they came
//! from. `h:` references stay verbatim until the supervisor resolves them
//! through the catalog.

pub mod ini;
pub mod store;

use std::fmt;
use std::path::Path;

use indexmap::IndexMap;
use serde::de::{self, Deserializer};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::paths;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_CONTEXT_SIZE: u32 = 4096;

/// Operating mode of a preset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Single,
    Router,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Single => write!(f, "single"),
            Mode::Router => write!(f, "router"),
        }
    }
}

/// Extra server flags, string→string, declared order preserved.
///
/// Values must be YAML scalars: booleans lowercase to `"true"`/`"false"`,
/// numbers stringify, null and nested collections are rejected at parse
/// time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options(pub IndexMap<String, String>);

impl Options {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Keys in ascending lexical order, for deterministic argument output.
    pub fn sorted_keys(&self) -> Vec<&String> {
        let mut keys: Vec<_> = self.0.keys().collect();
        keys.sort();
        keys
    }
}

impl<'de> Deserialize<'de> for Options {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = IndexMap::<String, serde_yaml::Value>::deserialize(deserializer)?;
        let mut out = IndexMap::with_capacity(raw.len());
        for (key, value) in raw {
            let value = match value {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                serde_yaml::Value::Null => {
                    return Err(de::Error::custom(format!(
                        "option {key:?} has a null value"
                    )))
                }
                _ => {
                    return Err(de::Error::custom(format!(
                        "option {key:?} must be a scalar"
                    )))
                }
            };
            out.insert(key, value);
        }
        Ok(Options(out))
    }
}

impl Serialize for Options {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// One model behind a router preset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: String,
    #[serde(
        default,
        rename = "draft-model",
        skip_serializing_if = "String::is_empty"
    )]
    pub draft_model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mmproj: String,
    #[serde(default, skip_serializing_if = "Options::is_empty")]
    pub options: Options,
}

/// A validated declarative preset document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mode: Mode,

    // single mode
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(
        default,
        rename = "draft-model",
        skip_serializing_if = "String::is_empty"
    )]
    pub draft_model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mmproj: String,

    // router mode
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<ModelEntry>,
    #[serde(default, rename = "max-models", skip_serializing_if = "is_zero_u32")]
    pub max_models: u32,
    #[serde(default, rename = "idle-timeout", skip_serializing_if = "is_zero_u64")]
    pub idle_timeout: u64,

    // common
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub port: u16,
    #[serde(default, rename = "context-size", skip_serializing_if = "is_zero_u32")]
    pub context_size: u32,
    #[serde(default, rename = "gpu-layers", skip_serializing_if = "is_zero_i32")]
    pub gpu_layers: i32,
    #[serde(default, skip_serializing_if = "Options::is_empty")]
    pub options: Options,
}

fn is_zero_u16(v: &u16) -> bool {
    *v == 0
}
fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}
fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}
fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

/// Option keys the preset schema owns; rejected in `options` maps.
const RESERVED_GLOBAL: &[&str] = &[
    "model",
    "model-draft",
    "mmproj",
    "port",
    "host",
    "models-max",
    "sleep-idle-seconds",
];
const RESERVED_ENTRY: &[&str] = &["model", "model-draft", "mmproj", "port", "host"];

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn mmproj_is_active(mmproj: &str) -> bool {
    !mmproj.is_empty() && mmproj != "none"
}

fn strip_file_prefix(value: &str) -> &str {
    value.strip_prefix("f:").unwrap_or(value)
}

fn check_no_line_breaks(field: &str, value: &str) -> Result<()> {
    if value.contains('\n') || value.contains('\r') {
        return Err(Error::preset_invalid(field, "must not contain line breaks"));
    }
    Ok(())
}

fn check_model_ref(field: &str, value: &str) -> Result<()> {
    check_no_line_breaks(field, value)?;
    if value.len() < 3 || !(value.starts_with("h:") || value.starts_with("f:")) {
        return Err(Error::preset_invalid(
            field,
            format!("{value:?} must be an h: or f: reference"),
        ));
    }
    Ok(())
}

fn check_mmproj(field: &str, value: &str) -> Result<()> {
    check_no_line_breaks(field, value)?;
    if value.is_empty() || value == "none" || value.starts_with("f:") {
        return Ok(());
    }
    Err(Error::preset_invalid(
        field,
        format!("{value:?} must be empty, \"none\", or an f: path"),
    ))
}

fn check_options(field: &str, options: &Options, reserved: &[&str]) -> Result<()> {
    for (key, value) in options.iter() {
        check_no_line_breaks(field, key)?;
        check_no_line_breaks(field, value)?;
        if key.is_empty() {
            return Err(Error::preset_invalid(field, "empty option key"));
        }
        if reserved.contains(&key.as_str()) {
            return Err(Error::preset_invalid(
                field,
                format!("option key {key:?} is reserved"),
            ));
        }
    }
    Ok(())
}

impl Preset {
    /// Parse a YAML document. Does not validate; callers pair this with
    /// `validate` (the store does both).
    pub fn parse(doc: &str) -> Result<Self> {
        serde_yaml::from_str(doc)
            .map_err(|e| Error::preset_invalid("document", e.to_string()))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::Other(e.to_string()))
    }

    /// Enforce the schema invariants. Fails with the first offending field.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_name(&self.name) {
            return Err(Error::preset_invalid(
                "name",
                format!("{:?} must match [A-Za-z0-9_-]+", self.name),
            ));
        }
        check_no_line_breaks("host", &self.host)?;
        check_options("options", &self.options, RESERVED_GLOBAL)?;

        match self.mode {
            Mode::Single => {
                if !self.models.is_empty() {
                    return Err(Error::preset_invalid(
                        "models",
                        "not allowed in single mode",
                    ));
                }
                if self.max_models != 0 {
                    return Err(Error::preset_invalid(
                        "max-models",
                        "not allowed in single mode",
                    ));
                }
                if self.idle_timeout != 0 {
                    return Err(Error::preset_invalid(
                        "idle-timeout",
                        "not allowed in single mode",
                    ));
                }
                check_model_ref("model", &self.model)?;
                if !self.draft_model.is_empty() {
                    check_model_ref("draft-model", &self.draft_model)?;
                }
                check_mmproj("mmproj", &self.mmproj)?;
            }
            Mode::Router => {
                if !self.model.is_empty() {
                    return Err(Error::preset_invalid(
                        "model",
                        "not allowed in router mode",
                    ));
                }
                if !self.draft_model.is_empty() {
                    return Err(Error::preset_invalid(
                        "draft-model",
                        "not allowed in router mode",
                    ));
                }
                if !self.mmproj.is_empty() {
                    return Err(Error::preset_invalid(
                        "mmproj",
                        "not allowed in router mode",
                    ));
                }
                if self.models.is_empty() {
                    return Err(Error::preset_invalid(
                        "models",
                        "router mode requires at least one model",
                    ));
                }
                let mut seen = Vec::with_capacity(self.models.len());
                for entry in &self.models {
                    if !is_valid_name(&entry.name) {
                        return Err(Error::preset_invalid(
                            "models.name",
                            format!("{:?} must match [A-Za-z0-9_-]+", entry.name),
                        ));
                    }
                    if seen.contains(&&entry.name) {
                        return Err(Error::preset_invalid(
                            "models.name",
                            format!("duplicate model name {:?}", entry.name),
                        ));
                    }
                    seen.push(&entry.name);
                    check_model_ref("models.model", &entry.model)?;
                    if !entry.draft_model.is_empty() {
                        check_model_ref("models.draft-model", &entry.draft_model)?;
                    }
                    check_mmproj("models.mmproj", &entry.mmproj)?;
                    check_options("models.options", &entry.options, RESERVED_ENTRY)?;
                }
            }
        }
        Ok(())
    }

    /// Return a copy with every relative `f:` path rewritten to an absolute
    /// one, resolved against `base_dir`. `h:` references are untouched.
    pub fn resolve_paths(&self, base_dir: &Path) -> Result<Preset> {
        let mut out = self.clone();
        out.model = resolve_ref(&self.model, base_dir)?;
        out.draft_model = resolve_ref(&self.draft_model, base_dir)?;
        out.mmproj = resolve_mmproj(&self.mmproj, base_dir)?;
        for entry in &mut out.models {
            entry.model = resolve_ref(&entry.model, base_dir)?;
            entry.draft_model = resolve_ref(&entry.draft_model, base_dir)?;
            entry.mmproj = resolve_mmproj(&entry.mmproj, base_dir)?;
        }
        Ok(out)
    }

    /// Host, defaulted so callers can treat the preset as fully populated.
    pub fn host(&self) -> &str {
        if self.host.is_empty() {
            DEFAULT_HOST
        } else {
            &self.host
        }
    }

    pub fn port(&self) -> u16 {
        if self.port == 0 {
            DEFAULT_PORT
        } else {
            self.port
        }
    }

    pub fn context_size(&self) -> u32 {
        if self.context_size == 0 {
            DEFAULT_CONTEXT_SIZE
        } else {
            self.context_size
        }
    }

    /// GPU layer count; zero means "all layers" (`-1`). A YAML zero is
    /// indistinguishable from an omitted field.
    pub fn gpu_layers(&self) -> i32 {
        if self.gpu_layers == 0 {
            -1
        } else {
            self.gpu_layers
        }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host(), self.port())
    }

    /// Command-line arguments for a single-mode launch.
    ///
    /// Options are emitted in ascending key order; a `"true"` value becomes
    /// a bare flag, `"false"` is omitted, anything else is `--key value`.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            strip_file_prefix(&self.model).to_string(),
            "--port".to_string(),
            self.port().to_string(),
            "--host".to_string(),
            self.host().to_string(),
        ];
        if !self.draft_model.is_empty() {
            args.push("--model-draft".to_string());
            args.push(strip_file_prefix(&self.draft_model).to_string());
        }
        if mmproj_is_active(&self.mmproj) {
            args.push("--mmproj".to_string());
            args.push(strip_file_prefix(&self.mmproj).to_string());
        }
        for key in self.options.sorted_keys() {
            match self.options.0[key].as_str() {
                "true" => args.push(format!("--{key}")),
                "false" => {}
                value => {
                    args.push(format!("--{key}"));
                    args.push(value.to_string());
                }
            }
        }
        args
    }

    /// Command-line arguments for a router-mode launch delegating model
    /// definitions to the generated config file.
    pub fn build_router_args(&self, config_path: &Path) -> Vec<String> {
        let mut args = vec![
            "--models-preset".to_string(),
            config_path.display().to_string(),
            "--port".to_string(),
            self.port().to_string(),
            "--host".to_string(),
            self.host().to_string(),
        ];
        if self.max_models > 0 {
            args.push("--models-max".to_string());
            args.push(self.max_models.to_string());
        }
        if self.idle_timeout > 0 {
            args.push("--sleep-idle-seconds".to_string());
            args.push(self.idle_timeout.to_string());
        }
        args
    }
}

fn resolve_ref(value: &str, base_dir: &Path) -> Result<String> {
    match value.strip_prefix("f:") {
        Some(path) => Ok(format!("f:{}", paths::resolve(path, base_dir)?.display())),
        None => Ok(value.to_string()),
    }
}

fn resolve_mmproj(value: &str, base_dir: &Path) -> Result<String> {
    if mmproj_is_active(value) {
        resolve_ref(value, base_dir)
    } else {
        Ok(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(doc: &str) -> Preset {
        let p = Preset::parse(doc).unwrap();
        p.validate().unwrap();
        p
    }

    #[test]
    fn parses_minimal_single_preset() {
        let p = single("name: test\nmodel: f:/m.gguf\n");
        assert_eq!(p.name, "test");
        assert_eq!(p.mode, Mode::Single);
        assert_eq!(p.model, "f:/m.gguf");
    }

    #[test]
    fn defaults_are_populated_by_accessors() {
        let p = single("name: test\nmodel: f:/m.gguf\n");
        assert_eq!(p.host(), "127.0.0.1");
        assert_eq!(p.port(), 8080);
        assert_eq!(p.context_size(), 4096);
        assert_eq!(p.gpu_layers(), -1);
        assert_eq!(p.endpoint(), "http://127.0.0.1:8080");
    }

    #[test]
    fn gpu_layers_zero_is_indistinguishable_from_omitted() {
        let omitted = single("name: a\nmodel: f:/m.gguf\n");
        let zero = single("name: a\nmodel: f:/m.gguf\ngpu-layers: 0\n");
        assert_eq!(omitted.gpu_layers(), zero.gpu_layers());
    }

    #[test]
    fn rejects_invalid_names() {
        for bad in ["", "has space", "semi;colon", "new\nline"] {
            let p = Preset {
                name: bad.to_string(),
                model: "f:/m.gguf".to_string(),
                ..Default::default()
            };
            assert!(matches!(
                p.validate(),
                Err(Error::PresetInvalid { ref field, .. }) if field == "name"
            ));
        }
    }

    #[test]
    fn rejects_line_breaks_in_fields() {
        let p = Preset {
            name: "test".into(),
            model: "f:/m\n.gguf".into(),
            ..Default::default()
        };
        assert!(p.validate().is_err());

        let p = Preset {
            name: "test".into(),
            model: "f:/m.gguf".into(),
            host: "127.0.0.1\r".into(),
            ..Default::default()
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn single_mode_forbids_router_fields() {
        for doc in [
            "name: a\nmodel: f:/m.gguf\nmodels:\n  - name: b\n    model: f:/b.gguf\n",
            "name: a\nmodel: f:/m.gguf\nmax-models: 2\n",
            "name: a\nmodel: f:/m.gguf\nidle-timeout: 30\n",
        ] {
            let p = Preset::parse(doc).unwrap();
            assert!(p.validate().is_err(), "doc should fail: {doc}");
        }
    }

    #[test]
    fn router_mode_forbids_single_fields() {
        let base = "mode: router\nname: a\nmodels:\n  - name: b\n    model: f:/b.gguf\n";
        for extra in ["model: f:/m.gguf\n", "draft-model: f:/d.gguf\n", "mmproj: none\n"] {
            let p = Preset::parse(&format!("{base}{extra}")).unwrap();
            assert!(p.validate().is_err(), "extra field should fail: {extra}");
        }
    }

    #[test]
    fn router_mode_requires_unique_model_names() {
        let doc = "mode: router\nname: a\nmodels:\n  - name: b\n    model: f:/b.gguf\n  - name: b\n    model: f:/c.gguf\n";
        let p = Preset::parse(doc).unwrap();
        assert!(p.validate().is_err());

        let empty = "mode: router\nname: a\nmodels: []\n";
        let p = Preset::parse(empty).unwrap();
        assert!(p.validate().is_err());
    }

    #[test]
    fn mmproj_grammar() {
        for (value, ok) in [
            ("", true),
            ("none", true),
            ("f:/proj.gguf", true),
            ("proj.gguf", false),
            ("h:org/r:Q4", false),
        ] {
            let p = Preset {
                name: "test".into(),
                model: "f:/m.gguf".into(),
                mmproj: value.into(),
                ..Default::default()
            };
            assert_eq!(p.validate().is_ok(), ok, "mmproj {value:?}");
        }
    }

    #[test]
    fn reserved_option_keys_are_rejected() {
        for key in ["model", "model-draft", "mmproj", "port", "host", "models-max", "sleep-idle-seconds"] {
            let doc = format!("name: a\nmodel: f:/m.gguf\noptions:\n  {key}: x\n");
            let p = Preset::parse(&doc).unwrap();
            assert!(p.validate().is_err(), "key {key} should be reserved");
        }
        // models-max and sleep-idle-seconds are allowed at the entry level
        let doc = "mode: router\nname: a\nmodels:\n  - name: b\n    model: f:/b.gguf\n    options:\n      models-max: 1\n";
        let p = Preset::parse(doc).unwrap();
        assert!(p.validate().is_ok());
    }

    #[test]
    fn option_values_must_be_scalars() {
        assert!(Preset::parse("name: a\nmodel: f:/m.gguf\noptions:\n  flag: ~\n").is_err());
        assert!(Preset::parse("name: a\nmodel: f:/m.gguf\noptions:\n  flag: [1]\n").is_err());
        let p = Preset::parse(
            "name: a\nmodel: f:/m.gguf\noptions:\n  threads: 8\n  flash-attn: true\n",
        )
        .unwrap();
        assert_eq!(p.options.0["threads"], "8");
        assert_eq!(p.options.0["flash-attn"], "true");
    }

    #[test]
    fn build_args_basic() {
        let p = single("name: test\nmodel: f:/m.gguf\nhost: 0.0.0.0\nport: 9000\n");
        assert_eq!(
            p.build_args(),
            vec!["-m", "/m.gguf", "--port", "9000", "--host", "0.0.0.0"]
        );
    }

    #[test]
    fn build_args_with_draft_and_mmproj() {
        let p = single(
            "name: test\nmodel: f:/m.gguf\ndraft-model: f:/d.gguf\nmmproj: f:/p.gguf\n",
        );
        assert_eq!(
            p.build_args(),
            vec![
                "-m", "/m.gguf", "--port", "8080", "--host", "127.0.0.1",
                "--model-draft", "/d.gguf", "--mmproj", "/p.gguf",
            ]
        );
    }

    #[test]
    fn build_args_options_sorted_with_flag_semantics() {
        let p = single(
            "name: test\nmodel: f:/m.gguf\noptions:\n  zeta: 1\n  alpha: true\n  beta: false\n  gamma: value\n",
        );
        assert_eq!(
            p.build_args(),
            vec![
                "-m", "/m.gguf", "--port", "8080", "--host", "127.0.0.1",
                "--alpha", "--gamma", "value", "--zeta", "1",
            ]
        );
    }

    #[test]
    fn build_router_args_includes_limits() {
        let doc = "mode: router\nname: a\nport: 9000\nmax-models: 2\nidle-timeout: 300\nmodels:\n  - name: b\n    model: f:/b.gguf\n";
        let p = Preset::parse(doc).unwrap();
        p.validate().unwrap();
        assert_eq!(
            p.build_router_args(Path::new("/tmp/router.ini")),
            vec![
                "--models-preset", "/tmp/router.ini", "--port", "9000",
                "--host", "127.0.0.1", "--models-max", "2",
                "--sleep-idle-seconds", "300",
            ]
        );
    }

    #[test]
    fn resolve_paths_rewrites_relative_file_refs() {
        let p = single("name: test\nmodel: f:models/m.gguf\ndraft-model: f:/abs/d.gguf\n");
        let resolved = p.resolve_paths(Path::new("/presets")).unwrap();
        assert_eq!(resolved.model, "f:/presets/models/m.gguf");
        assert_eq!(resolved.draft_model, "f:/abs/d.gguf");
        // the original is not mutated
        assert_eq!(p.model, "f:models/m.gguf");
    }

    #[test]
    fn resolve_paths_leaves_hf_refs_verbatim() {
        let p = single("name: test\nmodel: h:org/repo:Q4_K_M\n");
        let resolved = p.resolve_paths(Path::new("/presets")).unwrap();
        assert_eq!(resolved.model, "h:org/repo:Q4_K_M");
    }

    #[test]
    fn yaml_round_trip_is_identity() {
        let doc = "name: test\nmodel: f:/m.gguf\nport: 9000\noptions:\n  threads: 8\n  flash-attn: true\n";
        let p = Preset::parse(doc).unwrap();
        p.validate().unwrap();
        let rewritten = Preset::parse(&p.to_yaml().unwrap()).unwrap();
        assert_eq!(p, rewritten);
    }
}

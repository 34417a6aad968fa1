//! Workbench `config.ini` editing for the dashboard
//!
//! Values are exposed flat and upper-cased. `structure` remembers which
//! section each key came from so that a write reproduces the file layout.

use crate::error::WorkbenchError;
use ini::{EscapePolicy, Ini, ParseOption, Properties, WriteOption};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

pub const DEFAULT_SECTION: &str = "DEFAULT";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IniConfig {
    /// Values by exposed key
    pub config: Map<String, Value>,
    /// Section names, `DEFAULT` first
    pub sections: Vec<String>,
    /// File keys of each section
    pub structure: BTreeMap<String, Vec<String>>,
}

impl Default for IniConfig {
    fn default() -> Self {
        Self {
            config: Map::new(),
            sections: vec![DEFAULT_SECTION.to_string()],
            structure: BTreeMap::from([(DEFAULT_SECTION.to_string(), Vec::new())]),
        }
    }
}

/// File key to exposed key. `_ID` and `FLASK` are renamed for the form.
fn exposed_key(key: &str) -> &str {
    match key {
        "_ID" => "ID_",
        "FLASK" => "SERVER",
        other => other,
    }
}

fn render(key: &str, value: &Value) -> String {
    match (key, value) {
        ("MODE", Value::Bool(true)) => "EraseSectors".to_string(),
        ("MODE", Value::Bool(false)) => "EraseBasic".to_string(),
        (_, Value::Bool(true)) => "yes".to_string(),
        (_, Value::Bool(false)) => "no".to_string(),
        (_, Value::String(s)) => s.clone(),
        (_, Value::Null) => String::new(),
        (_, other) => other.to_string(),
    }
}

fn section_name(section: Option<&str>) -> &str {
    match section {
        None => DEFAULT_SECTION,
        Some(name) => name,
    }
}

pub fn read(path: &Path) -> Result<IniConfig, WorkbenchError> {
    if !path.exists() {
        return Ok(IniConfig::default());
    }

    let opt = ParseOption {
        enabled_quote: false,
        enabled_escape: false,
        ..ParseOption::default()
    };
    let ini = Ini::load_from_file_opt(path, opt)
        .map_err(|e| WorkbenchError::ConfigIni(e.to_string()))?;

    let mut parsed = IniConfig::default();

    // DEFAULT first: named sections only list keys DEFAULT does not have
    let (defaults, named): (Vec<_>, Vec<_>) = ini
        .iter()
        .partition(|(section, _)| section_name(*section) == DEFAULT_SECTION);

    for (section, props) in defaults.into_iter().chain(named) {
        let name = section_name(section).to_string();
        if !parsed.sections.contains(&name) {
            parsed.sections.push(name.clone());
        }

        for (key, value) in props.iter() {
            let key = key.to_uppercase();
            let listed_in_default = parsed
                .structure
                .get(DEFAULT_SECTION)
                .is_some_and(|keys| keys.contains(&key));
            let keys = parsed.structure.entry(name.clone()).or_default();
            if (name == DEFAULT_SECTION || !listed_in_default) && !keys.contains(&key) {
                keys.push(key.clone());
            }
            parsed
                .config
                .insert(exposed_key(&key).to_string(), Value::String(value.to_string()));
        }
    }

    Ok(parsed)
}

/// Write `data` back using the layout recorded in `layout`.
pub fn write(path: &Path, layout: &IniConfig, data: &Map<String, Value>) -> Result<(), WorkbenchError> {
    let mut ini = Ini::new();

    for section in &layout.sections {
        // Sections that only override DEFAULT keys still keep their header
        let props = ini
            .entry(Some(section.clone()))
            .or_insert_with(Properties::new);
        for key in layout.structure.get(section).into_iter().flatten() {
            let exposed = exposed_key(key);
            if let Some(value) = data.get(exposed) {
                props.insert(key.as_str(), render(exposed, value));
            }
        }
    }

    let opt = WriteOption {
        escape_policy: EscapePolicy::Nothing,
        ..WriteOption::default()
    };
    ini.write_to_file_opt(path, opt)?;
    Ok(())
}

/// Overlay `changes` on the current file and write it back.
pub fn edit(path: &Path, changes: Map<String, Value>) -> Result<IniConfig, WorkbenchError> {
    let mut current = read(path)?;
    for (key, value) in changes {
        let key = key.to_uppercase();
        if current.config.contains_key(&key) {
            current.config.insert(key, value);
        }
    }
    write(path, &current, &current.config)?;
    read(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = "\
[DEFAULT]
server = http://192.168.2.2:8091
_id = workbench-1
mode = EraseBasic
smart = yes
stress = 5

[computer]
smart = no
label = lab
";

    fn sample() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(&path, SAMPLE).unwrap();
        (dir, path)
    }

    #[test]
    fn read_maps_keys_and_structure() {
        let (_dir, path) = sample();
        let parsed = read(&path).unwrap();

        assert_eq!(parsed.sections, vec!["DEFAULT", "computer"]);
        assert_eq!(parsed.config["ID_"], "workbench-1");
        assert_eq!(parsed.config["SERVER"], "http://192.168.2.2:8091");
        assert_eq!(parsed.config["SMART"], "no", "sections override DEFAULT");
        assert_eq!(
            parsed.structure["DEFAULT"],
            vec!["SERVER", "_ID", "MODE", "SMART", "STRESS"]
        );
        assert_eq!(parsed.structure["computer"], vec!["LABEL"]);
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let parsed = read(&dir.path().join("nope.ini")).unwrap();
        assert!(parsed.config.is_empty());
        assert_eq!(parsed.sections, vec!["DEFAULT"]);
    }

    #[test]
    fn edit_renders_booleans_and_mode() {
        let (_dir, path) = sample();
        let mut changes = Map::new();
        changes.insert("MODE".into(), json!(true));
        changes.insert("smart".into(), json!(false));
        changes.insert("STRESS".into(), json!(10));
        changes.insert("ID_".into(), json!("workbench-2"));
        changes.insert("UNKNOWN".into(), json!("ignored"));

        let edited = edit(&path, changes).unwrap();
        assert_eq!(edited.config["MODE"], "EraseSectors");
        assert_eq!(edited.config["SMART"], "no");
        assert_eq!(edited.config["STRESS"], "10");
        assert_eq!(edited.config["ID_"], "workbench-2");
        assert!(!edited.config.contains_key("UNKNOWN"));

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("[DEFAULT]"));
        assert!(raw.contains("_ID=workbench-2"));
        assert!(raw.contains("SERVER=http://192.168.2.2:8091"));
    }

    #[test]
    fn edit_keeps_sections_without_own_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(&path, "[DEFAULT]\ntop = 1\nsmart = yes\n\n[computer]\nsmart = no\n").unwrap();

        let before = read(&path).unwrap();
        assert_eq!(before.sections, vec!["DEFAULT", "computer"]);
        assert!(before.structure["computer"].is_empty());

        let mut changes = Map::new();
        changes.insert("TOP".into(), json!(2));
        let edited = edit(&path, changes).unwrap();

        assert_eq!(edited.sections, vec!["DEFAULT", "computer"]);
        assert_eq!(edited.config["TOP"], "2");
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("[computer]"));
    }

    #[test]
    fn render_rules() {
        assert_eq!(render("MODE", &json!(false)), "EraseBasic");
        assert_eq!(render("SMART", &json!(true)), "yes");
        assert_eq!(render("LABEL", &json!("x")), "x");
        assert_eq!(render("LABEL", &Value::Null), "");
        assert_eq!(render("STRESS", &json!(3)), "3");
    }
}

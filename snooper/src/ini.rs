//! Minimal reader for the external tool's INI-style configuration file:
//! `[section]` headers, `key = value` pairs, `#`/`;` comments.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub(crate) struct IniFile {
    sections: HashMap<String, HashMap<String, String>>,
}

impl IniFile {
    pub(crate) fn parse(content: &str) -> Result<Self, String> {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current: Option<String> = None;
        for (number, raw_line) in content.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[') {
                let name = name
                    .strip_suffix(']')
                    .ok_or_else(|| format!("line {}: unterminated section header", number + 1))?
                    .trim();
                if name.is_empty() {
                    return Err(format!("line {}: empty section name", number + 1));
                }
                sections.entry(name.to_string()).or_default();
                current = Some(name.to_string());
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format!("line {}: expected 'key = value'", number + 1))?;
            let section = current
                .as_ref()
                .ok_or_else(|| format!("line {}: key outside of any section", number + 1))?;
            sections
                .get_mut(section)
                .expect("current section always inserted")
                .insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(IniFile { sections })
    }

    pub(crate) fn section(&self, name: &str) -> Option<&HashMap<String, String>> {
        self.sections.get(name)
    }
}

//! Archive manifest (`META-INF/MANIFEST.MF`)
//!
//! A main section of `Name: value` attributes followed by per-entry sections,
//! separated by blank lines. Long values continue on lines starting with a
//! single space.

use crate::error::{OnejarError, OnejarResult};
use crate::layout::MAIN_CLASS_ATTRIBUTE;

/// Maximum line length in bytes, excluding the line break
const LINE_LIMIT: usize = 72;

/// One per-entry section (typically digests of signed entries)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSection {
    pub attributes: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    main: Vec<(String, String)>,
    entries: Vec<ManifestSection>,
}

impl Manifest {
    /// A minimal manifest carrying only the version attribute
    pub fn new() -> Self {
        Self {
            main: vec![("Manifest-Version".to_string(), "1.0".to_string())],
            entries: Vec::new(),
        }
    }

    pub fn parse(text: &str) -> OnejarResult<Self> {
        let mut sections: Vec<Vec<(String, String)>> = vec![Vec::new()];
        let mut last: Option<(usize, usize)> = None;

        for (number, line) in text.lines().enumerate() {
            let line = line.trim_end_matches('\r');

            if line.is_empty() {
                if !sections.last().map(Vec::is_empty).unwrap_or(true) {
                    sections.push(Vec::new());
                }
                last = None;
                continue;
            }

            if let Some(continuation) = line.strip_prefix(' ') {
                let (section, attribute) = last.ok_or_else(|| OnejarError::InvalidManifest {
                    line: number + 1,
                    message: "continuation without attribute".to_string(),
                })?;
                sections[section][attribute].1.push_str(continuation);
                continue;
            }

            let (name, value) = line.split_once(": ").ok_or_else(|| OnejarError::InvalidManifest {
                line: number + 1,
                message: format!("expected 'Name: value', got '{}'", line),
            })?;

            let section = sections.len() - 1;
            sections[section].push((name.to_string(), value.to_string()));
            last = Some((section, sections[section].len() - 1));
        }

        let mut sections = sections.into_iter().filter(|s| !s.is_empty());
        let main = sections.next().unwrap_or_default();
        let entries = sections
            .map(|attributes| ManifestSection { attributes })
            .collect();

        Ok(Self { main, entries })
    }

    pub fn main_attribute(&self, name: &str) -> Option<&str> {
        self.main
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set a main attribute, replacing any existing value in place
    pub fn set_main_attribute(&mut self, name: &str, value: &str) {
        match self.main.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(attribute) => attribute.1 = value.to_string(),
            None => self.main.push((name.to_string(), value.to_string())),
        }
    }

    /// The entry-point attribute
    pub fn entry_point(&self) -> Option<&str> {
        self.main_attribute(MAIN_CLASS_ATTRIBUTE)
    }

    pub fn set_entry_point(&mut self, entry: &str) {
        self.set_main_attribute(MAIN_CLASS_ATTRIBUTE, entry);
    }

    pub fn entries(&self) -> &[ManifestSection] {
        &self.entries
    }

    /// Drop every per-entry section
    pub fn clear_entries(&mut self) {
        self.entries.clear();
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        write_section(&mut out, &self.main);
        out.push_str("\r\n");
        for section in &self.entries {
            write_section(&mut out, &section.attributes);
            out.push_str("\r\n");
        }
        out
    }
}

fn write_section(out: &mut String, attributes: &[(String, String)]) {
    for (name, value) in attributes {
        let line = format!("{}: {}", name, value);
        let mut rest = line.as_str();
        let mut limit = LINE_LIMIT;

        while rest.len() > limit {
            let mut cut = limit;
            while !rest.is_char_boundary(cut) {
                cut -= 1;
            }
            out.push_str(&rest[..cut]);
            out.push_str("\r\n ");
            rest = &rest[cut..];
            limit = LINE_LIMIT - 1;
        }
        out.push_str(rest);
        out.push_str("\r\n");
    }
}

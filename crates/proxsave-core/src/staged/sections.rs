//! Parser for the Proxmox "header + indented key/value" configuration
//! format: a section starts with `<type>: <name>`, followed by lines whose
//! first field is a key and whose remainder is the value. Blank lines
//! separate sections, `#` introduces comments.

/// A parsed section with key/value entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub kind: String,
    pub name: String,
    pub entries: Vec<(String, String)>,
}

impl Section {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A section kept verbatim (header line plus body lines), for merges that
/// must not reformat foreign content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSection {
    pub kind: String,
    pub name: String,
    pub lines: Vec<String>,
}

impl RawSection {
    /// The user id a section is about: the section name, minus a token
    /// suffix (`root@pam!automation` belongs to `root@pam`).
    pub fn user_id(&self) -> &str {
        self.name.split('!').next().unwrap_or(&self.name)
    }

    pub fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }
}

/// Keys never forwarded to command lines.
pub const FILTERED_KEYS: &[&str] = &["name", "digest"];

/// Keys whose values are secrets; their argv positions are redacted.
pub const SECRET_KEYS: &[&str] = &["password", "token", "secret", "apikey", "api-key"];

pub fn is_secret_key(key: &str) -> bool {
    SECRET_KEYS.contains(&kebab_key(key).as_str())
}

/// Normalize a config key for command-line use: lower case, `_` → `-`.
pub fn kebab_key(key: &str) -> String {
    key.to_ascii_lowercase().replace('_', "-")
}

fn parse_header(line: &str) -> Option<(String, String)> {
    if line.starts_with(char::is_whitespace) {
        return None;
    }
    let (kind, name) = line.split_once(':')?;
    let kind = kind.trim();
    let name = name.trim();
    if kind.is_empty() || name.is_empty() {
        return None;
    }
    if !kind
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return None;
    }
    Some((kind.to_string(), name.to_string()))
}

pub fn parse_sections(text: &str) -> Vec<Section> {
    parse_raw_sections(text)
        .into_iter()
        .map(|raw| {
            let mut entries = Vec::new();
            for line in raw.lines.iter().skip(1) {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }
                match trimmed.split_once(char::is_whitespace) {
                    Some((key, value)) => entries.push((key.to_string(), value.trim().to_string())),
                    None => entries.push((trimmed.to_string(), String::new())),
                }
            }
            Section {
                kind: raw.kind,
                name: raw.name,
                entries,
            }
        })
        .collect()
}

pub fn parse_raw_sections(text: &str) -> Vec<RawSection> {
    let mut sections: Vec<RawSection> = Vec::new();
    let mut current: Option<RawSection> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('#') {
            continue;
        }
        if trimmed.is_empty() {
            if let Some(section) = current.take() {
                sections.push(section);
            }
            continue;
        }
        if let Some((kind, name)) = parse_header(line) {
            if let Some(section) = current.take() {
                sections.push(section);
            }
            current = Some(RawSection {
                kind,
                name,
                lines: vec![line.to_string()],
            });
        } else if let Some(section) = current.as_mut() {
            section.lines.push(line.to_string());
        }
        // Body text before any header is dropped.
    }
    if let Some(section) = current.take() {
        sections.push(section);
    }
    sections
}

pub fn serialize_sections(sections: &[Section]) -> String {
    let mut out = String::new();
    for section in sections {
        out.push_str(&format!("{}: {}\n", section.kind, section.name));
        for (key, value) in &section.entries {
            if value.is_empty() {
                out.push_str(&format!("\t{key}\n"));
            } else {
                out.push_str(&format!("\t{key} {value}\n"));
            }
        }
        out.push('\n');
    }
    out
}

pub fn serialize_raw_sections(sections: &[RawSection]) -> String {
    let mut out = String::new();
    for section in sections {
        out.push_str(&section.render());
        out.push('\n');
    }
    out
}

/// Build `--key value` argument pairs for a section, dropping filtered
/// keys and flagging secrets for redaction.
pub fn section_command_args(section: &Section) -> Vec<(String, String, bool)> {
    let mut args = Vec::new();
    for (key, value) in &section.entries {
        let kebab = kebab_key(key);
        if FILTERED_KEYS.contains(&kebab.as_str()) {
            continue;
        }
        args.push((format!("--{kebab}"), value.clone(), is_secret_key(key)));
    }
    args
}

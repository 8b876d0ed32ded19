/// One entry of a directory listing on the story server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: Option<u64>,
    pub raw: String,
}

impl DirEntry {
    /// Dot-entries are server bookkeeping, not stories.
    pub fn is_story(&self) -> bool {
        !self.is_dir && !self.name.is_empty() && !self.name.starts_with('.')
    }
}

/// Parse one line of `LIST` output.
///
/// Unix-style lines (`drwxr-xr-x 1 user group size mon day time name`) keep
/// everything from the ninth column on as the name, spaces included. iNews
/// sometimes answers with shorter lines; those use the last token as the name.
pub fn parse_list_line(line: &str) -> Option<DirEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.is_empty() {
        return None;
    }

    if parts.len() < 9 {
        return Some(DirEntry {
            name: parts[parts.len() - 1].to_string(),
            is_dir: line.trim_start().starts_with('d'),
            size: None,
            raw: line.to_string(),
        });
    }

    Some(DirEntry {
        name: parts[8..].join(" "),
        is_dir: parts[0].starts_with('d'),
        size: parts[4].parse().ok(),
        raw: line.to_string(),
    })
}

pub fn parse_listing<I, S>(lines: I) -> Vec<DirEntry>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    lines
        .into_iter()
        .filter_map(|l| parse_list_line(l.as_ref()))
        .collect()
}

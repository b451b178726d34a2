//! Markdown note metadata: front matter, headings, tags, and wikilinks.
//!
//! Obsidian-style notes carry their metadata in three places: a YAML front
//! matter block, inline `#tags`, and `[[wikilinks]]` to other notes. The
//! front matter block is removed from the indexed body; everything else is
//! kept verbatim.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;
use yaml_rust::{Yaml, YamlLoader};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NoteMeta {
    #[serde(skip)]
    pub title: Option<String>,
    #[serde(skip)]
    pub author: Option<String>,
    pub tags: Vec<String>,
    pub links: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedNote {
    pub meta: NoteMeta,
    /// Note text with the front matter block removed.
    pub body: String,
}

impl NoteMeta {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|\s)#([\w/-]*[A-Za-z_][\w/-]*)").expect("valid tag regex")
    })
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[\[([^\]|#]+)(?:#[^\]|]*)?(?:\|[^\]]*)?\]\]").expect("valid link regex")
    })
}

pub fn parse_note(content: &str) -> ParsedNote {
    let (front, body) = split_front_matter(content);
    let mut meta = front.map(|yaml| parse_front_matter(&yaml)).unwrap_or_default();

    if meta.title.is_none() {
        meta.title = first_heading(&body);
    }

    let mut in_fence = false;
    for line in body.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        for cap in tag_re().captures_iter(line) {
            push_unique(&mut meta.tags, cap[1].to_string());
        }
        for cap in link_re().captures_iter(line) {
            push_unique(&mut meta.links, cap[1].trim().to_string());
        }
    }

    ParsedNote { meta, body }
}

/// Split a leading `---` delimited block off the note.
fn split_front_matter(content: &str) -> (Option<String>, String) {
    let text = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut lines = text.split_inclusive('\n');
    match lines.next() {
        Some(first) if first.trim_end() == "---" => {}
        _ => return (None, text.to_string()),
    }

    let mut yaml = String::new();
    let mut consumed = text.find('\n').map(|i| i + 1).unwrap_or(text.len());
    for line in lines {
        consumed += line.len();
        if line.trim_end() == "---" || line.trim_end() == "..." {
            let rest = text[consumed..].trim_start_matches(['\r', '\n']);
            return (Some(yaml), rest.to_string());
        }
        yaml.push_str(line);
    }

    (None, text.to_string())
}

fn parse_front_matter(yaml: &str) -> NoteMeta {
    let docs = match YamlLoader::load_from_str(yaml) {
        Ok(docs) => docs,
        Err(e) => {
            tracing::debug!("ignoring unparseable front matter: {}", e);
            return NoteMeta::default();
        }
    };
    let Some(doc) = docs.first() else {
        return NoteMeta::default();
    };

    let mut meta = NoteMeta {
        title: scalar(&doc["title"]),
        author: author(&doc["author"]).or_else(|| author(&doc["authors"])),
        ..Default::default()
    };
    for tag in string_list(&doc["tags"]).unwrap_or_default() {
        push_unique(&mut meta.tags, tag.trim_start_matches('#').to_string());
    }
    meta
}

fn scalar(value: &Yaml) -> Option<String> {
    let s = match value {
        Yaml::String(s) => s.clone(),
        Yaml::Integer(i) => i.to_string(),
        Yaml::Real(r) => r.clone(),
        _ => return None,
    };
    let s = s.trim().to_string();
    (!s.is_empty()).then_some(s)
}

fn author(value: &Yaml) -> Option<String> {
    match value {
        Yaml::Array(items) => {
            let names: Vec<String> = items.iter().filter_map(scalar).collect();
            (!names.is_empty()).then(|| names.join(", "))
        }
        other => scalar(other),
    }
}

/// A YAML list, or a comma/space separated string.
fn string_list(value: &Yaml) -> Option<Vec<String>> {
    match value {
        Yaml::Array(items) => Some(items.iter().filter_map(scalar).collect()),
        Yaml::String(s) => Some(
            s.split([',', ' '])
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        _ => None,
    }
}

fn first_heading(body: &str) -> Option<String> {
    body.lines()
        .find_map(|l| l.strip_prefix("# "))
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !value.is_empty() && !list.contains(&value) {
        list.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn front_matter_supplies_title_tags_and_author() {
        let note = parse_note(
            "---\ntitle: Burping\ntags: [infant, feeding]\nauthor: Jane Doe\n---\n\n# Heading\n\nHold upright.",
        );
        assert_eq!(note.meta.title.as_deref(), Some("Burping"));
        assert_eq!(note.meta.author.as_deref(), Some("Jane Doe"));
        assert_eq!(note.meta.tags, vec!["infant", "feeding"]);
        assert!(note.body.starts_with("# Heading"));
        assert!(!note.body.contains("tags:"));
    }

    #[test]
    fn heading_is_title_without_front_matter() {
        let note = parse_note("Intro line\n# Sleep Schedule\n\n## Naps\n");
        assert_eq!(note.meta.title.as_deref(), Some("Sleep Schedule"));
    }

    #[test]
    fn inline_tags_and_wikilinks_are_collected() {
        let note = parse_note(
            "# Colic\n\nSee [[Soothing Techniques|soothing]] and [[Feeding#Night]].\n#health #infant/0-3m #health\n",
        );
        assert_eq!(note.meta.tags, vec!["health", "infant/0-3m"]);
        assert_eq!(note.meta.links, vec!["Soothing Techniques", "Feeding"]);
    }

    #[test]
    fn headings_and_numbers_are_not_tags() {
        let note = parse_note("# Title\n## Sub\nIssue #42 fixed\n");
        assert!(note.meta.tags.is_empty());
    }

    #[test]
    fn fenced_code_is_ignored() {
        let note = parse_note("```\n#include <stdio.h>\n[[not a link]]\n```\n#real\n");
        assert_eq!(note.meta.tags, vec!["real"]);
        assert!(note.meta.links.is_empty());
    }

    #[test]
    fn unterminated_front_matter_is_body() {
        let note = parse_note("---\ntitle: Broken\nno closing fence");
        assert!(note.meta.title.is_none());
        assert!(note.body.contains("title: Broken"));
    }

    #[test]
    fn tag_string_is_split() {
        let note = parse_note("---\ntags: \"#sleep, naps\"\n---\nbody");
        assert_eq!(note.meta.tags, vec!["sleep", "naps"]);
    }

    #[test]
    fn metadata_json_has_tags_and_links() {
        let note = parse_note("#a [[B]]");
        let json: serde_json::Value = serde_json::from_str(&note.meta.to_json()).unwrap();
        assert_eq!(json["tags"][0], "a");
        assert_eq!(json["links"][0], "B");
        assert!(json.get("title").is_none());
    }
}

//! Script parsing.
//!
//! Backends are asked for a JSON script, but they do not always comply. A
//! response that parses as JSON (bare or inside a fenced block) is a
//! [`ParsedScript::Structured`]; anything else is read line by line for
//! `CHARACTER:` and `SCENE n:` markers and becomes a
//! [`ParsedScript::Heuristic`].

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptCharacter {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scene {
    #[serde(default)]
    pub description: String,
    /// Names of characters on screen.
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub narration: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub characters: Vec<ScriptCharacter>,
    #[serde(default)]
    pub scenes: Vec<Scene>,
}

/// A script together with how it was recovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedScript {
    Structured(Script),
    Heuristic(Script),
}

impl ParsedScript {
    pub fn script(&self) -> &Script {
        match self {
            ParsedScript::Structured(script) | ParsedScript::Heuristic(script) => script,
        }
    }

    pub fn into_script(self) -> Script {
        match self {
            ParsedScript::Structured(script) | ParsedScript::Heuristic(script) => script,
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, ParsedScript::Structured(_))
    }
}

pub fn parse_script(text: &str) -> ParsedScript {
    if let Some(script) = parse_structured(text) {
        return ParsedScript::Structured(script);
    }
    ParsedScript::Heuristic(parse_heuristic(text))
}

fn parse_structured(text: &str) -> Option<Script> {
    let trimmed = text.trim();
    let candidate = fenced_block(trimmed).unwrap_or(trimmed);
    let script: Script = serde_json::from_str(candidate).ok()?;
    if script.scenes.is_empty() && script.characters.is_empty() {
        return None;
    }
    Some(script)
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

fn character_line() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)^\s*character\s*:\s*(?P<name>[^:\-–]+?)\s*[:\-–]\s*(?P<desc>.+?)\s*$").ok())
        .as_ref()
}

fn scene_line() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)^\s*(?:#+\s*)?scene\s*(?P<num>\d+)\s*[:.\-–]?\s*(?P<rest>.*?)\s*$").ok())
        .as_ref()
}

fn narration_line() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)^\s*(?:narration|narrator|voice\s*over|vo)\s*:\s*(?P<text>.+?)\s*$").ok())
        .as_ref()
}

fn title_line() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)^\s*(?:title\s*:|#\s+)\s*(?P<title>.+?)\s*$").ok())
        .as_ref()
}

fn parse_heuristic(text: &str) -> Script {
    let mut script = Script::default();
    let mut current: Option<Scene> = None;

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(caps) = character_line().and_then(|re| re.captures(line)) {
            script.characters.push(ScriptCharacter {
                name: caps["name"].trim().to_string(),
                description: caps["desc"].to_string(),
            });
            continue;
        }
        if let Some(caps) = scene_line().and_then(|re| re.captures(line)) {
            if let Some(scene) = current.take() {
                script.scenes.push(scene);
            }
            current = Some(Scene {
                description: caps["rest"].to_string(),
                ..Scene::default()
            });
            continue;
        }
        if script.title.is_empty() && current.is_none() {
            if let Some(caps) = title_line().and_then(|re| re.captures(line)) {
                script.title = caps["title"].to_string();
                continue;
            }
        }
        let Some(scene) = current.as_mut() else {
            continue;
        };
        if let Some(caps) = narration_line().and_then(|re| re.captures(line)) {
            append(&mut scene.narration, &caps["text"]);
        } else {
            append(&mut scene.description, line.trim());
        }
    }
    if let Some(scene) = current.take() {
        script.scenes.push(scene);
    }

    if script.scenes.is_empty() {
        script.scenes = paragraphs(text)
            .into_iter()
            .filter(|p| {
                !p.lines()
                    .all(|l| character_line().map(|re| re.is_match(l)).unwrap_or(false))
            })
            .map(|description| Scene {
                description,
                ..Scene::default()
            })
            .collect();
    }

    let names: Vec<String> = script.characters.iter().map(|c| c.name.clone()).collect();
    for scene in &mut script.scenes {
        let haystack = format!("{} {}", scene.description, scene.narration).to_lowercase();
        scene.characters = names
            .iter()
            .filter(|name| haystack.contains(&name.to_lowercase()))
            .cloned()
            .collect();
    }
    script
}

fn append(target: &mut String, text: &str) {
    if !target.is_empty() {
        target.push(' ');
    }
    target.push_str(text);
}

fn paragraphs(text: &str) -> Vec<String> {
    text.split("\n\n")
        .map(|p| p.lines().map(str::trim).collect::<Vec<_>>().join(" "))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

//! Skills: user-authored prompt bundles exposed through a single `skill`
//! tool.
//!
//! A skill is a directory containing `SKILL.md` with YAML front-matter
//! (`name`, `description`, optional `license`, `allowed-tools`,
//! `metadata`) followed by the prompt body. Discovery searches, in
//! priority order:
//!
//! 1. `<project>/.claude/skills/`
//! 2. `<project>/.minion/skills/`
//! 3. `~/.claude/skills/`
//! 4. `~/.minion/skills/`
//!
//! Project-level entries override user-level entries with the same name.
//! The core sees skills only through [`SkillTool`], which resolves a
//! name to its prompt text on invocation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{debug, warn};

use crate::tools::Tool;
use crate::value::Value;
use crate::Result;

const SKILL_DIRS: &[&str] = &[".claude/skills", ".minion/skills"];
const SKILL_FILE: &str = "SKILL.md";

#[derive(Debug, Deserialize)]
struct FrontMatter {
    name: String,
    description: String,
    #[serde(default)]
    license: Option<String>,
    #[serde(default, rename = "allowed-tools")]
    allowed_tools: Vec<String>,
    #[serde(default)]
    metadata: HashMap<String, serde_yaml::Value>,
}

/// Where a skill was found; project-level wins on name collisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillLocation {
    Project,
    User,
}

impl std::fmt::Display for SkillLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkillLocation::Project => write!(f, "project"),
            SkillLocation::User => write!(f, "user"),
        }
    }
}

/// A loaded skill with its metadata and prompt body.
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// The markdown body (instructions), front-matter stripped.
    pub content: String,
    /// Directory the skill lives in, for resolving bundled resources.
    pub path: PathBuf,
    pub license: Option<String>,
    pub allowed_tools: Vec<String>,
    pub metadata: HashMap<String, serde_yaml::Value>,
    pub location: SkillLocation,
}

impl Skill {
    /// Parse a `SKILL.md` file. Returns `None` when the file is missing,
    /// has no front-matter, or lacks a name or description.
    pub fn from_skill_md(skill_md: &Path, location: SkillLocation) -> Option<Skill> {
        let content = std::fs::read_to_string(skill_md).ok()?;
        let (front_matter, body) = split_front_matter(&content)?;
        let parsed: FrontMatter = match serde_yaml::from_str(front_matter) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(path = %skill_md.display(), error = %e, "invalid skill front-matter");
                return None;
            }
        };
        if parsed.name.is_empty() || parsed.description.is_empty() {
            return None;
        }
        Some(Skill {
            name: parsed.name,
            description: parsed.description,
            content: body.trim().to_string(),
            path: skill_md.parent()?.to_path_buf(),
            license: parsed.license,
            allowed_tools: parsed.allowed_tools,
            metadata: parsed.metadata,
            location,
        })
    }

    /// Full prompt: a base-directory header (so relative references to
    /// bundled scripts and assets resolve) followed by the body.
    pub fn prompt(&self) -> String {
        format!(
            "Loading: {}\nBase directory: {}\n\n{}",
            self.name,
            self.path.display(),
            self.content
        )
    }

    /// Compact XML entry for listing skills inside prompts.
    pub fn to_xml(&self) -> String {
        format!(
            "<skill>\n<name>{}</name>\n<description>{}</description>\n<location>{}</location>\n</skill>",
            self.name, self.description, self.location
        )
    }
}

/// Split `---\n...\n---\n` front-matter from the body.
fn split_front_matter(content: &str) -> Option<(&str, &str)> {
    let pattern = regex::RegexBuilder::new(r"\A---\s*\n(.*?)\n---\s*\n(.*)\z")
        .dot_matches_new_line(true)
        .build()
        .expect("static pattern");
    let captures = pattern.captures(content)?;
    Some((
        captures.get(1)?.as_str(),
        captures.get(2).map(|m| m.as_str()).unwrap_or(""),
    ))
}

/// Discovers and loads skills from the standard directories.
pub struct SkillLoader {
    project_root: PathBuf,
    home_dir: Option<PathBuf>,
}

impl SkillLoader {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            home_dir: std::env::var_os("HOME").map(PathBuf::from),
        }
    }

    /// Override (or disable) the home directory used for user-level
    /// skill discovery.
    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        self.home_dir = home;
        self
    }

    /// All search paths with their location type, project paths first.
    pub fn search_paths(&self) -> Vec<(PathBuf, SkillLocation)> {
        let mut paths = Vec::new();
        for dir in SKILL_DIRS {
            paths.push((self.project_root.join(dir), SkillLocation::Project));
        }
        if let Some(home) = &self.home_dir {
            for dir in SKILL_DIRS {
                paths.push((home.join(dir), SkillLocation::User));
            }
        }
        paths
    }

    /// Find `SKILL.md` files directly under a skills directory, plus one
    /// nested level (e.g. `document-skills/pdf/SKILL.md`).
    fn discover(&self, skills_dir: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let Ok(entries) = std::fs::read_dir(skills_dir) else {
            return found;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let skill_md = path.join(SKILL_FILE);
            if skill_md.exists() {
                found.push(skill_md);
                continue;
            }
            if let Ok(nested) = std::fs::read_dir(&path) {
                for nested_entry in nested.flatten() {
                    let nested_path = nested_entry.path();
                    if nested_path.is_dir() {
                        let nested_md = nested_path.join(SKILL_FILE);
                        if nested_md.exists() {
                            found.push(nested_md);
                        }
                    }
                }
            }
        }
        found
    }

    /// Load every discoverable skill. Earlier (project) entries win on
    /// name collisions.
    pub fn load_all(&self) -> Vec<Skill> {
        let mut by_name: HashMap<String, Skill> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for (dir, location) in self.search_paths() {
            for skill_md in self.discover(&dir) {
                if let Some(skill) = Skill::from_skill_md(&skill_md, location) {
                    if by_name.contains_key(&skill.name) {
                        debug!(skill = %skill.name, "shadowed by higher-priority skill");
                        continue;
                    }
                    order.push(skill.name.clone());
                    by_name.insert(skill.name.clone(), skill);
                }
            }
        }
        order
            .into_iter()
            .filter_map(|name| by_name.remove(&name))
            .collect()
    }
}

/// The `skill` tool: resolves a skill name to its prompt text.
pub struct SkillTool {
    skills: HashMap<String, Skill>,
}

impl SkillTool {
    pub fn new(skills: impl IntoIterator<Item = Skill>) -> Self {
        Self {
            skills: skills.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    /// Load from the standard search paths rooted at `project_root`.
    pub fn from_project(project_root: impl Into<PathBuf>) -> Self {
        Self::new(SkillLoader::new(project_root).load_all())
    }

    pub fn skill_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.skills.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait::async_trait]
impl Tool for SkillTool {
    fn name(&self) -> &str {
        "skill"
    }

    fn description(&self) -> String {
        if self.skills.is_empty() {
            return "Load a skill's instructions by name. No skills are currently installed."
                .to_string();
        }
        let listing = self
            .skills
            .values()
            .map(Skill::to_xml)
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Load a skill's instructions by name. Available skills:\n{listing}"
        )
    }

    fn inputs(&self) -> Json {
        serde_json::json!({
            "name": {"type": "string", "description": "Name of the skill to load"},
        })
    }

    fn output_type(&self) -> &str {
        "string"
    }

    fn readonly(&self) -> bool {
        true
    }

    async fn invoke(&self, arguments: Json) -> Result<Value> {
        let name = arguments
            .get("name")
            .and_then(Json::as_str)
            .unwrap_or_default();
        match self.skills.get(name) {
            Some(skill) => Ok(Value::Str(skill.prompt())),
            None => Ok(Value::Str(format!(
                "Error: no skill named '{name}'. Available skills: {}",
                self.skill_names().join(", ")
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_skill(dir: &Path, slug: &str, name: &str, body: &str) {
        let skill_dir = dir.join(slug);
        fs::create_dir_all(&skill_dir).unwrap();
        fs::write(
            skill_dir.join("SKILL.md"),
            format!(
                "---\nname: {name}\ndescription: A test skill\nlicense: MIT\nallowed-tools:\n  - bash\n---\n{body}\n"
            ),
        )
        .unwrap();
    }

    #[test]
    fn test_front_matter_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let skills = dir.path().join(".claude/skills");
        write_skill(&skills, "commit", "commit", "Make a commit following conventions.");

        let loader = SkillLoader::new(dir.path()).with_home(None);
        let loaded = loader.load_all();
        assert_eq!(loaded.len(), 1);
        let skill = &loaded[0];
        assert_eq!(skill.name, "commit");
        assert_eq!(skill.license.as_deref(), Some("MIT"));
        assert_eq!(skill.allowed_tools, vec!["bash"]);
        assert_eq!(skill.location, SkillLocation::Project);
        assert!(skill.content.contains("Make a commit"));
    }

    #[test]
    fn test_missing_front_matter_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let skill_dir = dir.path().join(".claude/skills/broken");
        fs::create_dir_all(&skill_dir).unwrap();
        fs::write(skill_dir.join("SKILL.md"), "no front matter here").unwrap();

        let loaded = SkillLoader::new(dir.path()).with_home(None).load_all();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_project_overrides_minion_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(
            &dir.path().join(".claude/skills"),
            "deploy",
            "deploy",
            "claude version",
        );
        write_skill(
            &dir.path().join(".minion/skills"),
            "deploy",
            "deploy",
            "minion version",
        );

        let loaded = SkillLoader::new(dir.path()).with_home(None).load_all();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].content.contains("claude version"));
    }

    #[test]
    fn test_nested_skill_discovery() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(
            &dir.path().join(".claude/skills/document-skills"),
            "pdf",
            "pdf",
            "Handle PDFs.",
        );
        let loaded = SkillLoader::new(dir.path()).with_home(None).load_all();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "pdf");
    }

    #[tokio::test]
    async fn test_skill_tool_resolves_prompt() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(
            &dir.path().join(".claude/skills"),
            "review",
            "review",
            "Review the diff carefully.",
        );
        let tool = SkillTool::from_project(dir.path());

        let prompt = tool
            .invoke(serde_json::json!({"name": "review"}))
            .await
            .unwrap();
        let text = prompt.py_str();
        assert!(text.starts_with("Loading: review"));
        assert!(text.contains("Base directory:"));
        assert!(text.contains("Review the diff carefully."));

        let missing = tool
            .invoke(serde_json::json!({"name": "nope"}))
            .await
            .unwrap();
        assert!(missing.py_str().contains("no skill named 'nope'"));
    }

    #[test]
    fn test_skill_tool_description_lists_skills() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(&dir.path().join(".claude/skills"), "a", "alpha", "body");
        let tool = SkillTool::from_project(dir.path());
        let description = tool.description();
        assert!(description.contains("<name>alpha</name>"));
        assert!(description.contains("<location>project</location>"));
    }
}

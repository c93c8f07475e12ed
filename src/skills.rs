//! Skills: named markdown documents listed in the system prompt's skills
//! index. Only the frontmatter is loaded up front; the body is fetched on
//! demand through the `read-skill` tool.

use serde::Deserialize;
use std::path::Path;

use crate::memory::split_frontmatter;

/// A skill's index entry.
#[derive(Debug, Clone)]
pub struct Skill {
    pub slug: String,
    pub summary: String,
    pub when_to_use: String,
}

/// Frontmatter schema for `skills/{slug}.md`. Strict: unknown keys are a
/// validation error and the skill is skipped.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct SkillFrontmatter {
    summary: String,
    when_to_use: String,
}

/// Load every skill index entry under `{agent_root}/skills/`, sorted by
/// slug. Files failing the strict schema are logged and skipped.
pub fn load_skills(agent_root: &Path) -> Vec<Skill> {
    let dir = agent_root.join("skills");
    let mut skills = Vec::new();

    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(_) => return skills,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let Some(slug) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
            continue;
        };
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("[SKILLS] failed to read {}: {}", path.display(), e);
                continue;
            }
        };

        let Some((toml_part, _body)) = split_frontmatter(&raw) else {
            log::warn!("[SKILLS] {} has no frontmatter, skipping", path.display());
            continue;
        };

        match toml::from_str::<SkillFrontmatter>(toml_part) {
            Ok(front) => skills.push(Skill {
                slug,
                summary: front.summary,
                when_to_use: front.when_to_use,
            }),
            Err(e) => {
                log::warn!("[SKILLS] invalid frontmatter in {}: {}", path.display(), e);
            }
        }
    }

    skills.sort_by(|a, b| a.slug.cmp(&b.slug));
    skills
}

/// Read the full body of one skill document.
pub fn read_skill_body(agent_root: &Path, slug: &str) -> Result<String, String> {
    let path = agent_root.join("skills").join(format!("{}.md", slug));
    std::fs::read_to_string(&path).map_err(|e| format!("skill '{}' not readable: {}", slug, e))
}

//! Pre-dispatch prompt transforms for codex.
//!
//! All transforms are pure over `(prompt, project_path)`: they may read the
//! project's skill directory but never mutate any state.

use std::path::Path;

/// Appended when a prompt looks big enough to be worth delegating.
const SUB_AGENT_HINT: &str = "\n\n(If this breaks into independent pieces, consider delegating \
parts to sub-agents and merging their results.)";

/// Appended to short continuations and very large prompts so long tasks end
/// with a proper report instead of trailing off.
const LONG_TASK_HINT: &str = "\n\n(This looks like a long-running task. When you finish, post a \
short report of what was done and what remains.)";

/// Prompts at or past this size get the sub-agent hint.
const SUB_AGENT_SIZE_THRESHOLD: usize = 1800;
/// Bullet lines at or past this count get the sub-agent hint.
const SUB_AGENT_BULLET_THRESHOLD: usize = 8;
/// Fenced blocks at or past this count get the sub-agent hint.
const SUB_AGENT_FENCE_THRESHOLD: usize = 2;
/// Prompts past this size get the long-task hint.
const LONG_TASK_SIZE_THRESHOLD: usize = 6000;

/// Short messages that mean "keep going" in the languages we see.
const CONTINUATIONS: [&str; 6] = ["continue", "go on", "keep going", "resume", "계속", "이어서"];

/// Run the codex transform chain: skill auto-linking, then the sub-agent and
/// long-task hints.
pub fn transform_codex_prompt(prompt: &str, project_path: &Path) -> String {
    let mut out = auto_link_skills(prompt, project_path);
    if needs_sub_agent_hint(&out) {
        out.push_str(SUB_AGENT_HINT);
    }
    if needs_long_task_hint(prompt) {
        out.push_str(LONG_TASK_HINT);
    }
    out
}

/// Append `@` mentions for project skills whose name appears in the prompt.
///
/// Scans `<project>/.agents/skills/<name>/SKILL.md`; a skill matches when its
/// directory name occurs in the prompt case-insensitively.
pub fn auto_link_skills(prompt: &str, project_path: &Path) -> String {
    let skills_dir = project_path.join(".agents").join("skills");
    let Ok(entries) = std::fs::read_dir(&skills_dir) else {
        return prompt.to_string();
    };

    let lowered = prompt.to_lowercase();
    let mut links = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.is_empty() || !entry.path().join("SKILL.md").is_file() {
            continue;
        }
        if lowered.contains(&name.to_lowercase()) {
            links.push(format!("@.agents/skills/{name}/SKILL.md"));
        }
    }

    if links.is_empty() {
        return prompt.to_string();
    }
    links.sort();
    format!("{prompt}\n\nSkills: {}", links.join(" "))
}

/// Big prompts, bullet-dense prompts, and multi-fence prompts get the
/// sub-agent hint.
pub fn needs_sub_agent_hint(prompt: &str) -> bool {
    if prompt.chars().count() >= SUB_AGENT_SIZE_THRESHOLD {
        return true;
    }
    let bullets = prompt
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            trimmed.starts_with("- ") || trimmed.starts_with("* ") || trimmed.starts_with("+ ")
        })
        .count();
    if bullets >= SUB_AGENT_BULLET_THRESHOLD {
        return true;
    }
    let fences = prompt.matches("```").count() / 2;
    fences >= SUB_AGENT_FENCE_THRESHOLD
}

/// Continuations of an ongoing task and oversized prompts get the long-task
/// report hint.
pub fn needs_long_task_hint(prompt: &str) -> bool {
    let trimmed = prompt.trim().to_lowercase();
    if CONTINUATIONS
        .iter()
        .any(|continuation| trimmed == *continuation || trimmed == format!("{continuation}."))
    {
        return true;
    }
    prompt.chars().count() > LONG_TASK_SIZE_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_prompt_passes_through_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = transform_codex_prompt("fix the login bug", dir.path());
        assert_eq!(out, "fix the login bug");
    }

    #[test]
    fn matching_skill_gets_linked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let skill = dir.path().join(".agents/skills/deploy");
        std::fs::create_dir_all(&skill).expect("mkdir");
        std::fs::write(skill.join("SKILL.md"), "# deploy").expect("write");

        let out = auto_link_skills("please deploy the staging site", dir.path());
        assert!(out.ends_with("Skills: @.agents/skills/deploy/SKILL.md"));

        let untouched = auto_link_skills("unrelated request", dir.path());
        assert_eq!(untouched, "unrelated request");
    }

    #[test]
    fn skill_without_manifest_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join(".agents/skills/deploy")).expect("mkdir");

        let out = auto_link_skills("deploy it", dir.path());
        assert_eq!(out, "deploy it");
    }

    #[test]
    fn bullet_density_triggers_sub_agent_hint() {
        let bullets = (0..9).map(|i| format!("- task {i}")).collect::<Vec<_>>().join("\n");
        assert!(needs_sub_agent_hint(&bullets));
        assert!(!needs_sub_agent_hint("- one\n- two"));
    }

    #[test]
    fn fence_count_triggers_sub_agent_hint() {
        let prompt = "```rust\na\n```\nand\n```sh\nb\n```";
        assert!(needs_sub_agent_hint(prompt));
        assert!(!needs_sub_agent_hint("```rust\nonly one\n```"));
    }

    #[test]
    fn continuations_trigger_long_task_hint() {
        assert!(needs_long_task_hint("continue"));
        assert!(needs_long_task_hint("  Continue.  "));
        assert!(needs_long_task_hint("계속"));
        assert!(!needs_long_task_hint("continue the discussion about naming"));
    }

    #[test]
    fn oversized_prompt_gets_both_hints() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prompt = "x".repeat(7000);
        let out = transform_codex_prompt(&prompt, dir.path());
        assert!(out.contains("sub-agents"));
        assert!(out.contains("short report"));
    }
}

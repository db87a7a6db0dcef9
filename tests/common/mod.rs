//! Shared fixtures for the end-to-end tests: a fake agent binary driven by
//! a decisions file, and a config rooted inside a tempdir.
#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use conductor::config::{Config, ProviderSpec};

/// A shell-script "agent": reads the prompt from stdin, finds the status
/// path on a `STATUS_FILE=` line, pops the next decision from the file named
/// on a `DECISIONS=` line, and writes status.json accordingly. Special
/// decisions: `exitNN` exits with code NN, `silent` writes no status.
pub fn write_fake_agent(dir: &Path) -> PathBuf {
    let script = dir.join("fake-agent.sh");
    fs::write(
        &script,
        r#"#!/bin/sh
prompt=$(cat)
status=$(printf '%s\n' "$prompt" | sed -n 's/^STATUS_FILE=//p' | head -n 1)
plan=$(printf '%s\n' "$prompt" | sed -n 's/^DECISIONS=//p' | head -n 1)
decision=continue
if [ -n "$plan" ] && [ -s "$plan" ]; then
  decision=$(head -n 1 "$plan")
  tail -n +2 "$plan" > "$plan.next" && mv "$plan.next" "$plan"
fi
case "$decision" in
  exit*)
    echo "agent crashing"
    exit "${decision#exit}"
    ;;
  silent)
    echo "agent wrote no status"
    exit 0
    ;;
esac
printf '{"decision": "%s", "reason": "scripted", "summary": "iteration done"}' "$decision" > "$status"
echo "agent output"
"#,
    )
    .unwrap();
    make_executable(&script);
    script
}

/// An agent that fails its first invocation (creating a flag file passed as
/// `$1`) and succeeds with a `stop` status afterwards.
pub fn write_fail_once_agent(dir: &Path) -> PathBuf {
    let script = dir.join("fail-once-agent.sh");
    fs::write(
        &script,
        r#"#!/bin/sh
prompt=$(cat)
status=$(printf '%s\n' "$prompt" | sed -n 's/^STATUS_FILE=//p' | head -n 1)
if [ ! -f "$1" ]; then
  touch "$1"
  echo "first run crashes"
  exit 1
fi
printf '{"decision": "stop", "reason": "recovered", "summary": "second attempt"}' > "$status"
echo "agent output"
"#,
    )
    .unwrap();
    make_executable(&script);
    script
}

/// A queue probe printing as many lines as the counter file holds, then
/// decrementing it. Counts down e.g. 3, 2, 1, 0 across probes.
pub fn write_queue_probe(dir: &Path) -> PathBuf {
    let script = dir.join("fake-queue.sh");
    fs::write(
        &script,
        r#"#!/bin/sh
n=$(cat "$1")
i=0
while [ "$i" -lt "$n" ]; do
  echo "item-$i"
  i=$((i+1))
done
if [ "$n" -gt 0 ]; then
  echo $((n-1)) > "$1"
fi
"#,
    )
    .unwrap();
    make_executable(&script);
    script
}

fn make_executable(path: &Path) {
    let mut permissions = fs::metadata(path).unwrap().permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(path, permissions).unwrap();
}

/// Config rooted in the tempdir with the fake agent wired up as both the
/// `claude` and `codex` providers.
pub fn test_config(root: &Path, agent_script: &Path) -> Config {
    let mut config = Config::default();
    config.paths.sessions = root.join("sessions").to_string_lossy().to_string();
    config.paths.locks = root.join("locks").to_string_lossy().to_string();
    config.paths.stages = root.join("stages").to_string_lossy().to_string();
    config.agents.delay_seconds = 0;
    config.logging.to_file = false;
    config.agents.providers = vec![
        ProviderSpec {
            name: "claude".to_string(),
            command: agent_script.to_string_lossy().to_string(),
            args: vec![],
            default_model: "sonnet".to_string(),
        },
        ProviderSpec {
            name: "codex".to_string(),
            command: agent_script.to_string_lossy().to_string(),
            args: vec![],
            default_model: "gpt-5-codex".to_string(),
        },
    ];
    config
}

/// Write a stage-type directory with its yaml and prompt body.
pub fn write_stage_type(config: &Config, name: &str, yaml: &str, prompt: &str) {
    let dir = PathBuf::from(&config.paths.stages).join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("stage.yaml"), yaml).unwrap();
    fs::write(dir.join("prompt.md"), prompt).unwrap();
}

/// The prompt preamble the fake agent parses.
pub fn agent_prompt(decisions_file: &Path) -> String {
    format!(
        "STATUS_FILE=${{STATUS}}\nDECISIONS={}\nSession ${{SESSION}} iteration ${{ITERATION}}\n",
        decisions_file.display()
    )
}

pub fn write_decisions(path: &Path, decisions: &[&str]) {
    fs::write(path, decisions.join("\n")).unwrap();
}

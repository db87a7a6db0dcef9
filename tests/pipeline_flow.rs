//! End-to-end multi-stage pipelines: sequential stage wiring, parallel
//! provider fan-out with manifest join, and failed-provider resume.

mod common;

use std::fs;
use std::sync::Arc;

use tempfile::TempDir;

use conductor::agent::SystemAgentClient;
use conductor::config::ProviderSpec;
use conductor::context::{ContextDoc, RunScope};
use conductor::error::EngineError;
use conductor::manifest::BlockManifest;
use conductor::pipeline::executor::{run_pipeline, RunOptions};
use conductor::pipeline::{normalize, parse_pipeline, PipelineSpec};
use conductor::session::SessionPaths;
use conductor::stage::Resolution;
use conductor::state::{RunStatus, StageStatus, StateStore};

use common::*;

fn build_spec(config: &conductor::config::Config, yaml: &str) -> PipelineSpec {
    let raw = parse_pipeline(yaml).unwrap();
    normalize(&raw, config, &Resolution::default()).unwrap()
}

async fn run(
    config: &conductor::config::Config,
    spec: &PipelineSpec,
    session: &str,
    resume: bool,
) -> Result<(), EngineError> {
    let scope = RunScope::new(
        session,
        &spec.name,
        SessionPaths::new(&config.sessions_root(), session),
        config.clone(),
    );
    let options = RunOptions {
        resume,
        definition_text: Some("# as-run copy\n".to_string()),
        ..RunOptions::default()
    };
    run_pipeline(&scope, spec, Arc::new(SystemAgentClient::new()), &options)
        .await
        .map(|_| ())
}

#[tokio::test]
async fn sequential_stages_tag_history_and_reset_counters() {
    let temp = TempDir::new().unwrap();
    let agent = write_fake_agent(temp.path());
    let config = test_config(temp.path(), &agent);

    let decisions = temp.path().join("decisions.txt");
    // Stage polish: stop, stop (plateau at 2). Stage verify: 3 fixed runs.
    write_decisions(
        &decisions,
        &["stop", "stop", "continue", "continue", "continue"],
    );

    let yaml = format!(
        r"
name: edit-flow
defaults:
  provider: claude
stages:
  - name: polish
    prompt: |
{prompt}
    termination:
      type: judgment
      min_iterations: 2
      consensus: 2
      max_iterations: 10
  - name: verify
    prompt: |
{prompt}
    runs: 3
",
        prompt = indent(&agent_prompt(&decisions), 6)
    );
    let spec = build_spec(&config, &yaml);

    run(&config, &spec, "edit-run", false).await.unwrap();

    let paths = SessionPaths::new(&config.sessions_root(), "edit-run");
    let store = StateStore::open(&paths.state_file()).unwrap();
    let state = store.state();
    assert_eq!(state.status, RunStatus::Complete);
    assert_eq!(state.stages.len(), 2);
    assert!(state
        .stages
        .iter()
        .all(|s| s.status == StageStatus::Complete));

    assert_eq!(state.history.len(), 5);
    assert!(state.history[..2].iter().all(|h| h.stage == "polish"));
    assert!(state.history[2..].iter().all(|h| h.stage == "verify"));
    // Counters were reset between stages: the final values are verify's.
    assert_eq!(state.iteration_completed, 3);

    // The as-run definition was copied into the run directory.
    assert!(paths.pipeline_file().exists());
}

#[tokio::test]
async fn parallel_block_joins_and_feeds_downstream() {
    let temp = TempDir::new().unwrap();
    let agent = write_fake_agent(temp.path());
    let config = test_config(temp.path(), &agent);

    // No DECISIONS line: the fake agent defaults to `continue`, and the
    // fixed windows bound every stage.
    let yaml = r"
name: dual-plan
defaults:
  provider: claude
stages:
  - name: dual-refine
    parallel:
      providers: [claude, codex]
      stages:
        - name: plan
          prompt: |
            STATUS_FILE=${STATUS}
            Plan for ${SESSION}
  - name: merge
    prompt: |
      STATUS_FILE=${STATUS}
      Merge the plans
    inputs:
      from_parallel:
        stage: plan
        block: dual-refine
        select: latest
";
    let spec = build_spec(&config, yaml);

    run(&config, &spec, "dual-run", false).await.unwrap();

    let paths = SessionPaths::new(&config.sessions_root(), "dual-run");
    let block_dir = paths.run_dir().join("parallel-00-dual-refine");

    for provider in ["claude", "codex"] {
        let output = block_dir
            .join("providers")
            .join(provider)
            .join("stage-00-plan/iterations/001/output.md");
        assert!(output.exists(), "missing {}", output.display());

        let provider_state = StateStore::open(
            &block_dir.join("providers").join(provider).join("state.json"),
        )
        .unwrap();
        assert_eq!(provider_state.state().status, RunStatus::Complete);
    }

    let manifest = BlockManifest::load(&block_dir.join("manifest.json")).unwrap();
    assert_eq!(manifest.providers.len(), 2);

    // The merge stage's context saw one latest output per provider.
    let merge_ctx = ContextDoc::load(
        &paths
            .run_dir()
            .join("stage-01-merge/iterations/001/context.json"),
    )
    .unwrap();
    let plan_inputs = &merge_ctx.inputs.from_stage["plan"];
    assert_eq!(plan_inputs.len(), 2);
    assert!(plan_inputs.iter().all(|p| p.exists()));

    let store = StateStore::open(&paths.state_file()).unwrap();
    assert_eq!(store.state().status, RunStatus::Complete);
    assert_eq!(store.state().stages.len(), 2);
}

#[tokio::test]
async fn failed_provider_rerun_on_resume() {
    let temp = TempDir::new().unwrap();
    let good_agent = write_fake_agent(temp.path());
    let flaky_agent = write_fail_once_agent(temp.path());
    let flag = temp.path().join("codex-crashed.flag");

    let mut config = test_config(temp.path(), &good_agent);
    config.agents.providers = vec![
        ProviderSpec {
            name: "claude".to_string(),
            command: good_agent.to_string_lossy().to_string(),
            args: vec![],
            default_model: "sonnet".to_string(),
        },
        ProviderSpec {
            name: "codex".to_string(),
            command: flaky_agent.to_string_lossy().to_string(),
            args: vec![flag.to_string_lossy().to_string()],
            default_model: "gpt-5-codex".to_string(),
        },
    ];

    let yaml = r"
name: half-fail
defaults:
  provider: claude
stages:
  - name: dual
    parallel:
      providers: [claude, codex]
      stages:
        - name: plan
          prompt: |
            STATUS_FILE=${STATUS}
            Plan it
";
    let spec = build_spec(&config, yaml);

    let err = run(&config, &spec, "half-run", false).await.unwrap_err();
    match &err {
        EngineError::ParallelBlockFailed { failed, .. } => {
            assert_eq!(failed, &vec!["codex".to_string()]);
        }
        other => panic!("expected parallel failure, got {other:?}"),
    }

    let paths = SessionPaths::new(&config.sessions_root(), "half-run");
    let block_dir = paths.run_dir().join("parallel-00-dual");
    {
        let pipeline_state = StateStore::open(&paths.state_file()).unwrap();
        assert_eq!(pipeline_state.state().status, RunStatus::Failed);
        assert_eq!(
            pipeline_state.state().error.as_ref().unwrap().error_type,
            "parallel_block_failed"
        );

        let claude_state =
            StateStore::open(&block_dir.join("providers/claude/state.json")).unwrap();
        assert_eq!(claude_state.state().status, RunStatus::Complete);
        let codex_state =
            StateStore::open(&block_dir.join("providers/codex/state.json")).unwrap();
        assert_eq!(codex_state.state().status, RunStatus::Failed);
        assert!(!block_dir.join("manifest.json").exists());
    }

    // Resume: only codex re-runs (its flag file now exists, so it succeeds);
    // claude is skipped, not re-invoked.
    let claude_output_before = fs::read_to_string(
        block_dir.join("providers/claude/stage-00-plan/iterations/001/output.md"),
    )
    .unwrap();
    let claude_mtime_before = fs::metadata(
        block_dir.join("providers/claude/stage-00-plan/iterations/001/output.md"),
    )
    .unwrap()
    .modified()
    .unwrap();

    run(&config, &spec, "half-run", true).await.unwrap();

    let manifest = BlockManifest::load(&block_dir.join("manifest.json")).unwrap();
    assert_eq!(manifest.providers.len(), 2);
    for provider in ["claude", "codex"] {
        let state = StateStore::open(
            &block_dir.join("providers").join(provider).join("state.json"),
        )
        .unwrap();
        assert_eq!(state.state().status, RunStatus::Complete);
    }

    let claude_output_path =
        block_dir.join("providers/claude/stage-00-plan/iterations/001/output.md");
    assert_eq!(
        fs::read_to_string(&claude_output_path).unwrap(),
        claude_output_before
    );
    assert_eq!(
        fs::metadata(&claude_output_path).unwrap().modified().unwrap(),
        claude_mtime_before
    );

    let pipeline_state = StateStore::open(&paths.state_file()).unwrap();
    assert_eq!(pipeline_state.state().status, RunStatus::Complete);
}

/// Indent every line of `text` by `n` spaces (for YAML block scalars).
fn indent(text: &str, n: usize) -> String {
    let pad = " ".repeat(n);
    text.lines()
        .map(|l| format!("{pad}{l}"))
        .collect::<Vec<_>>()
        .join("\n")
}

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use mplp_core::config::{AgentKind, AppConfig};
use mplp_engine::WorkflowFile;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

/// Print a checklist for the config and, optionally, a workflow file.
/// Returns the number of failed checks.
pub fn run_doctor(config: &AppConfig, workflow: Option<&Path>) -> usize {
    let mut checks = vec![check_engine(config), check_agents(config), check_log_dir(config)];
    if let Some(path) = workflow {
        checks.push(check_workflow(config, path));
    }

    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
    fail_count
}

fn check_engine(config: &AppConfig) -> CheckResult {
    let engine = &config.engine;
    if engine.initial_backoff_ms > engine.max_backoff_ms {
        return CheckResult {
            label: "Engine".into(),
            ok: false,
            detail: format!(
                "initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                engine.initial_backoff_ms, engine.max_backoff_ms
            ),
        };
    }
    let concurrency = engine
        .default_concurrency
        .map_or("unbounded".to_string(), |c| c.to_string());
    CheckResult {
        label: "Engine".into(),
        ok: true,
        detail: format!(
            "retries {}, concurrency {}, backoff {}..{}ms",
            engine.default_retries, concurrency, engine.initial_backoff_ms, engine.max_backoff_ms
        ),
    }
}

fn check_agents(config: &AppConfig) -> CheckResult {
    if config.agents.is_empty() {
        return CheckResult {
            label: "Agents".into(),
            ok: false,
            detail: "No [[agents]] configured".into(),
        };
    }

    let mut seen = BTreeSet::new();
    let mut problems = Vec::new();
    for agent in &config.agents {
        if !seen.insert(agent.id.as_str()) {
            problems.push(format!("'{}' defined twice", agent.id));
        }
        if agent.kind == AgentKind::Command {
            match agent.command.as_deref() {
                Some(cmd) if find_program(cmd).is_none() => {
                    problems.push(format!("'{}': command '{}' not found", agent.id, cmd));
                }
                Some(_) => {}
                None => problems.push(format!("'{}': missing command", agent.id)),
            }
        }
    }

    if problems.is_empty() {
        CheckResult {
            label: "Agents".into(),
            ok: true,
            detail: format!("{} configured", config.agents.len()),
        }
    } else {
        CheckResult {
            label: "Agents".into(),
            ok: false,
            detail: problems.join("; "),
        }
    }
}

fn check_log_dir(config: &AppConfig) -> CheckResult {
    let Some(log) = &config.log else {
        return CheckResult {
            label: "Run log".into(),
            ok: true,
            detail: "Disabled".into(),
        };
    };

    let dir = log.log_dir();
    if let Err(e) = std::fs::create_dir_all(&dir) {
        return CheckResult {
            label: "Run log".into(),
            ok: false,
            detail: format!("{} (cannot create: {})", dir.display(), e),
        };
    }
    let probe = dir.join(".doctor_test");
    match std::fs::write(&probe, "test") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            CheckResult {
                label: "Run log".into(),
                ok: true,
                detail: format!("{} (level {})", dir.display(), log.level),
            }
        }
        Err(e) => CheckResult {
            label: "Run log".into(),
            ok: false,
            detail: format!("{} (not writable: {})", dir.display(), e),
        },
    }
}

fn check_workflow(config: &AppConfig, path: &Path) -> CheckResult {
    let label = format!("Workflow {}", path.display());
    let definition = match WorkflowFile::load(path).and_then(WorkflowFile::into_definition) {
        Ok(d) => d,
        Err(e) => {
            return CheckResult {
                label,
                ok: false,
                detail: e.to_string(),
            }
        }
    };

    let configured: BTreeSet<&str> = config.agents.iter().map(|a| a.id.as_str()).collect();
    let missing: Vec<String> = definition
        .agent_ids()
        .into_iter()
        .filter(|id| !configured.contains(id.as_str()))
        .collect();

    if missing.is_empty() {
        CheckResult {
            label,
            ok: true,
            detail: format!("'{}', {} steps", definition.name, definition.total_steps()),
        }
    } else {
        CheckResult {
            label,
            ok: false,
            detail: format!("agents not configured: {}", missing.join(", ")),
        }
    }
}

/// Resolve a program the way a shell would: paths are checked directly,
/// bare names are searched on `PATH`.
fn find_program(program: &str) -> Option<PathBuf> {
    let direct = Path::new(program);
    if direct.components().count() > 1 {
        return direct.is_file().then(|| direct.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mplp_core::config::AgentConfig;

    fn agent(id: &str, kind: AgentKind, command: Option<&str>) -> AgentConfig {
        AgentConfig {
            id: id.into(),
            kind,
            category: None,
            command: command.map(str::to_string),
            args: Vec::new(),
            env: Default::default(),
        }
    }

    #[test]
    fn test_agents_check() {
        let mut config = AppConfig::default();
        assert!(!check_agents(&config).ok);

        config.agents.push(agent("echo", AgentKind::Echo, None));
        assert!(check_agents(&config).ok);

        config.agents.push(agent("echo", AgentKind::Echo, None));
        let check = check_agents(&config);
        assert!(!check.ok);
        assert!(check.detail.contains("defined twice"));
    }

    #[test]
    fn test_missing_program() {
        let mut config = AppConfig::default();
        config.agents.push(agent(
            "ghost",
            AgentKind::Command,
            Some("definitely-not-a-real-program-mplp"),
        ));
        assert!(!check_agents(&config).ok);
    }

    #[test]
    fn test_engine_backoff_order() {
        let mut config = AppConfig::default();
        assert!(check_engine(&config).ok);
        config.engine.initial_backoff_ms = 10_000;
        config.engine.max_backoff_ms = 10;
        assert!(!check_engine(&config).ok);
    }
}

//! Script step command lines
//!
//! A script step runs through `sh -c` in the job container, so everything
//! the runner hands over is quoted before it reaches the shell.

use std::collections::BTreeMap;

use berth_core::dto::args::RunScriptStepArgs;
use berth_core::error::{HookError, Result};

/// Wraps a value in single quotes for `sh`
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn check_env_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains(['=', '\'', '"', '$']) {
        return Err(HookError::InvalidInput(format!(
            "environment key {} is invalid - the key must not contain =, $, ', or \"",
            key
        )));
    }
    Ok(())
}

/// `env 'K=V' ...` prefix, empty when there is nothing to set
fn env_prefix(env: &BTreeMap<String, String>) -> Result<String> {
    if env.is_empty() {
        return Ok(String::new());
    }
    let mut assignments = Vec::with_capacity(env.len());
    for (key, value) in env {
        check_env_key(key)?;
        assignments.push(shell_quote(&format!("{}={}", key, value)));
    }
    Ok(format!("env {} ", assignments.join(" ")))
}

/// Shell script running the step in its working directory
pub fn step_script(args: &RunScriptStepArgs) -> Result<String> {
    let mut script = String::new();
    if !args.prepend_path.is_empty() {
        script.push_str(&format!(
            "export PATH={}:\"$PATH\"; ",
            shell_quote(&args.prepend_path.join(":"))
        ));
    }

    let command = std::iter::once(&args.entry_point)
        .chain(args.entry_point_args.iter())
        .map(|part| shell_quote(part))
        .collect::<Vec<_>>()
        .join(" ");

    script.push_str(&format!(
        "cd {} && exec {}{}",
        shell_quote(&args.working_directory),
        env_prefix(&args.environment_variables)?,
        command
    ));
    Ok(script)
}

/// Full exec command of a script step
pub fn step_command(args: &RunScriptStepArgs) -> Result<Vec<String>> {
    if args.entry_point.is_empty() {
        return Err(HookError::InvalidInput(
            "script step requires an entry point".to_string(),
        ));
    }
    Ok(vec!["sh".to_string(), "-c".to_string(), step_script(args)?])
}

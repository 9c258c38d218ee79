//! # sqlorm-cli
//!
//! The `sqlorm` command. Every invocation names a models file; its
//! `config` section configures the databases and its `models` list is
//! registered before the command runs.
//!
//! ```text
//! sqlorm --models models.json makemigrations -n add_views
//! sqlorm --models models.json migrate
//! sqlorm --models models.toml -v 0 showmigrations
//! ```
//!
//! Commands are [`ManagementCommand`] implementations collected in a
//! [`CommandRegistry`]; [`run`] wires them to the process arguments.

#![allow(clippy::result_large_err)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::unused_async)]

use std::ffi::OsString;

use anyhow::Context;

pub mod command;
pub mod commands;
pub mod models_file;

pub use command::{CommandContext, CommandRegistry, ManagementCommand};
pub use models_file::ModelsFile;

/// Exit status of a successful run.
pub const EXIT_SUCCESS: u8 = 0;

/// Exit status of a failed run or of a run without a command.
pub const EXIT_FAILURE: u8 = 1;

/// A registry holding the built-in commands.
pub fn builtin_registry() -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    commands::register_builtin_commands(&mut registry);
    registry
}

/// Parses `args` (program name first), loads the models file, and runs
/// the selected command. Returns the process exit status; errors are left
/// for the caller to report.
pub async fn run<I, T>(args: I) -> anyhow::Result<u8>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let registry = builtin_registry();
    let mut cli = registry.build_cli();
    let matches = match cli.try_get_matches_from_mut(args) {
        Ok(matches) => matches,
        Err(e) => {
            let failed = e.use_stderr();
            e.print()?;
            return Ok(if failed { EXIT_FAILURE } else { EXIT_SUCCESS });
        }
    };
    if matches.subcommand().is_none() {
        cli.print_help()?;
        return Ok(EXIT_FAILURE);
    }

    let verbosity = matches.get_one::<u8>("verbosity").copied().unwrap_or(1);
    sqlorm_core::logging::setup_cli_logging(verbosity);

    let path = matches
        .get_one::<String>("models")
        .context("the --models <FILE> option is required")?;
    let file = ModelsFile::load(path)?;
    sqlorm::configure_settings(file.settings()?)
        .with_context(|| format!("Invalid configuration in {path}"))?;
    let models = file
        .register_models()
        .with_context(|| format!("Invalid models in {path}"))?;
    tracing::debug!(count = models.len(), "models registered");

    let context = CommandContext::new(verbosity, sqlorm::get_settings()?);
    let result = registry.execute(&matches, &context).await;
    sqlorm::close_all_connections().await?;
    result?;
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = builtin_registry();
        assert_eq!(
            registry.list_commands(),
            vec!["inspectdb", "makemigrations", "migrate", "showmigrations", "syncdb"]
        );
    }

    #[tokio::test]
    async fn test_run_without_command_fails() {
        assert_eq!(run(["sqlorm"]).await.unwrap(), EXIT_FAILURE);
        assert_eq!(run(["sqlorm", "--version"]).await.unwrap(), EXIT_SUCCESS);
        assert_eq!(run(["sqlorm", "frobnicate"]).await.unwrap(), EXIT_FAILURE);
    }

    #[tokio::test]
    async fn test_run_requires_models() {
        let err = run(["sqlorm", "migrate"]).await.unwrap_err();
        assert!(err.to_string().contains("--models"));
    }
}

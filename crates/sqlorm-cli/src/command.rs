//! Management command framework.
//!
//! A [`ManagementCommand`] names itself, declares its arguments and handles
//! a parsed invocation. The [`CommandRegistry`] builds the `sqlorm`
//! command line from every registered command and dispatches to the one
//! selected.
//!
//! ## Defining a Command
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use sqlorm_cli::command::{CommandContext, ManagementCommand};
//! use sqlorm_core::SqlormResult;
//!
//! struct TablesCommand;
//!
//! #[async_trait]
//! impl ManagementCommand for TablesCommand {
//!     fn name(&self) -> &str { "tables" }
//!     fn help(&self) -> &str { "List the tables of the default database" }
//!
//!     async fn handle(
//!         &self,
//!         _matches: &clap::ArgMatches,
//!         _context: &CommandContext,
//!     ) -> SqlormResult<()> {
//!         for table in sqlorm::get_table_names("default").await? {
//!             println!("{table}");
//!         }
//!         Ok(())
//!     }
//! }
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use sqlorm_core::{Settings, SqlormError, SqlormResult};
use tracing::Instrument;

/// Everything a command sees besides its own arguments.
#[derive(Debug, Clone, Default)]
pub struct CommandContext {
    /// 0 is quiet, 1 normal, 2 verbose.
    pub verbosity: u8,
    /// The settings the models file configured.
    pub settings: Settings,
}

impl CommandContext {
    pub fn new(verbosity: u8, settings: Settings) -> Self {
        Self {
            verbosity,
            settings,
        }
    }
}

/// A subcommand of the `sqlorm` command line.
#[async_trait]
pub trait ManagementCommand: Send + Sync {
    /// The name the command is invoked by.
    fn name(&self) -> &str;

    /// One line of help text.
    fn help(&self) -> &str;

    /// Adds the command's own arguments. The default adds none.
    fn add_arguments(&self, cmd: clap::Command) -> clap::Command {
        cmd
    }

    /// Runs the command with its parsed arguments.
    async fn handle(
        &self,
        matches: &clap::ArgMatches,
        context: &CommandContext,
    ) -> SqlormResult<()>;
}

/// The registered management commands, by name.
pub struct CommandRegistry {
    commands: HashMap<String, Box<dyn ManagementCommand>>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            commands: HashMap::new(),
        }
    }

    /// Registers a command, replacing any command of the same name.
    pub fn register(&mut self, command: Box<dyn ManagementCommand>) {
        let name = command.name().to_string();
        self.commands.insert(name, command);
    }

    pub fn get(&self, name: &str) -> Option<&dyn ManagementCommand> {
        self.commands.get(name).map(AsRef::as_ref)
    }

    /// Registered command names, sorted.
    pub fn list_commands(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Builds the `sqlorm` command line with the global options and one
    /// subcommand per registered command.
    ///
    /// A subcommand is not required by the parser: running without one
    /// prints the help and fails, which the caller decides.
    pub fn build_cli(&self) -> clap::Command {
        let mut app = clap::Command::new("sqlorm")
            .about("Models, queries and migrations without project scaffolding")
            .version(env!("CARGO_PKG_VERSION"))
            .arg(
                clap::Arg::new("verbosity")
                    .short('v')
                    .long("verbosity")
                    .value_parser(clap::value_parser!(u8).range(0..=2))
                    .default_value("1")
                    .global(true)
                    .help("Verbosity level: 0 quiet, 1 normal, 2 verbose"),
            )
            .arg(
                clap::Arg::new("models")
                    .long("models")
                    .value_name("FILE")
                    .global(true)
                    .help("JSON or TOML file with the models and an optional config section"),
            );

        let mut entries: Vec<_> = self.commands.iter().collect();
        entries.sort_by_key(|(name, _)| (*name).clone());

        for (name, cmd) in entries {
            // Subcommand names must be 'static; commands are registered once.
            let static_name: &'static str = Box::leak(name.clone().into_boxed_str());
            let subcmd = clap::Command::new(static_name).about(cmd.help().to_string());
            app = app.subcommand(cmd.add_arguments(subcmd));
        }

        app
    }

    /// Runs the subcommand selected in `matches`.
    pub async fn execute(
        &self,
        matches: &clap::ArgMatches,
        context: &CommandContext,
    ) -> SqlormResult<()> {
        let (name, sub_matches) = matches.subcommand().ok_or_else(|| {
            SqlormError::ConfigurationError("No subcommand specified".to_string())
        })?;

        let cmd = self
            .get(name)
            .ok_or_else(|| SqlormError::ConfigurationError(format!("Unknown command: {name}")))?;

        cmd.handle(sub_matches, context)
            .instrument(sqlorm_core::logging::command_span(name))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestCommand {
        cmd_name: String,
    }

    impl TestCommand {
        fn new(name: &str) -> Self {
            Self {
                cmd_name: name.to_string(),
            }
        }
    }

    #[async_trait]
    impl ManagementCommand for TestCommand {
        fn name(&self) -> &str {
            &self.cmd_name
        }

        fn help(&self) -> &'static str {
            "A test command"
        }

        fn add_arguments(&self, cmd: clap::Command) -> clap::Command {
            cmd.arg(
                clap::Arg::new("fake")
                    .long("fake")
                    .action(clap::ArgAction::SetTrue),
            )
        }

        async fn handle(
            &self,
            matches: &clap::ArgMatches,
            context: &CommandContext,
        ) -> SqlormResult<()> {
            if matches.get_flag("fake") && context.verbosity == 0 {
                return Err(SqlormError::ConfigurationError("quiet fake".to_string()));
            }
            Ok(())
        }
    }

    struct FailingCommand;

    #[async_trait]
    impl ManagementCommand for FailingCommand {
        fn name(&self) -> &'static str {
            "fail"
        }

        fn help(&self) -> &'static str {
            "A command that always fails"
        }

        async fn handle(
            &self,
            _matches: &clap::ArgMatches,
            _context: &CommandContext,
        ) -> SqlormResult<()> {
            Err(SqlormError::ConfigurationError("deliberate failure".to_string()))
        }
    }

    #[test]
    fn test_registry_new_is_empty() {
        let registry = CommandRegistry::default();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_register_get_and_replace() {
        let mut registry = CommandRegistry::new();
        registry.register(Box::new(TestCommand::new("syncdb")));
        registry.register(Box::new(TestCommand::new("syncdb")));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("syncdb").unwrap().help(), "A test command");
        assert!(registry.get("runserver").is_none());
    }

    #[test]
    fn test_list_commands_sorted() {
        let mut registry = CommandRegistry::new();
        registry.register(Box::new(TestCommand::new("showmigrations")));
        registry.register(Box::new(TestCommand::new("inspectdb")));
        registry.register(Box::new(TestCommand::new("migrate")));
        assert_eq!(
            registry.list_commands(),
            vec!["inspectdb", "migrate", "showmigrations"]
        );
    }

    #[test]
    fn test_build_cli_global_options() {
        let mut registry = CommandRegistry::new();
        registry.register(Box::new(TestCommand::new("migrate")));

        let matches = registry
            .build_cli()
            .try_get_matches_from(["sqlorm", "--models", "models.json", "-v", "2", "migrate", "--fake"])
            .unwrap();
        assert_eq!(matches.get_one::<u8>("verbosity"), Some(&2));
        assert_eq!(
            matches.get_one::<String>("models").map(String::as_str),
            Some("models.json")
        );
        let (name, sub_matches) = matches.subcommand().unwrap();
        assert_eq!(name, "migrate");
        assert!(sub_matches.get_flag("fake"));
    }

    #[test]
    fn test_build_cli_defaults_and_limits() {
        let registry = CommandRegistry::new();
        let matches = registry.build_cli().try_get_matches_from(["sqlorm"]).unwrap();
        assert_eq!(matches.get_one::<u8>("verbosity"), Some(&1));
        assert!(matches.subcommand().is_none());

        let err = registry
            .build_cli()
            .try_get_matches_from(["sqlorm", "-v", "3"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);

        let err = registry
            .build_cli()
            .try_get_matches_from(["sqlorm", "--version"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[tokio::test]
    async fn test_execute_dispatches() {
        let mut registry = CommandRegistry::new();
        registry.register(Box::new(TestCommand::new("migrate")));
        registry.register(Box::new(FailingCommand));
        let cli = registry.build_cli();

        let matches = cli.clone().try_get_matches_from(["sqlorm", "migrate"]).unwrap();
        assert!(registry.execute(&matches, &CommandContext::default()).await.is_ok());

        let matches = cli
            .clone()
            .try_get_matches_from(["sqlorm", "migrate", "--fake"])
            .unwrap();
        let quiet = CommandContext::new(0, Settings::default());
        assert!(registry.execute(&matches, &quiet).await.is_err());

        let matches = cli.clone().try_get_matches_from(["sqlorm", "fail"]).unwrap();
        let err = registry
            .execute(&matches, &CommandContext::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("deliberate failure"));

        let matches = cli.try_get_matches_from(["sqlorm"]).unwrap();
        assert!(registry.execute(&matches, &CommandContext::default()).await.is_err());
    }
}

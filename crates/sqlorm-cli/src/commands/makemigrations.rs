//! The `makemigrations` management command.

use async_trait::async_trait;
use sqlorm_core::SqlormResult;

use crate::command::{CommandContext, ManagementCommand};

/// Writes a migration file for the changes between the migrations on disk
/// and the models in the models file.
pub struct MakemigrationsCommand;

#[async_trait]
impl ManagementCommand for MakemigrationsCommand {
    fn name(&self) -> &'static str {
        "makemigrations"
    }

    fn help(&self) -> &'static str {
        "Create a migration from model changes"
    }

    fn add_arguments(&self, cmd: clap::Command) -> clap::Command {
        cmd.arg(
            clap::Arg::new("name")
                .short('n')
                .long("name")
                .help("Use this name for the migration file"),
        )
    }

    async fn handle(
        &self,
        matches: &clap::ArgMatches,
        context: &CommandContext,
    ) -> SqlormResult<()> {
        let name = matches.get_one::<String>("name").map(String::as_str);
        match sqlorm::makemigrations(name)? {
            Some(path) if context.verbosity > 0 => {
                println!("Created migration {}", path.display());
            }
            None if context.verbosity > 0 => println!("No changes detected"),
            _ => {}
        }
        Ok(())
    }
}

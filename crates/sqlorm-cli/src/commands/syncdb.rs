//! The `syncdb` management command.

use async_trait::async_trait;
use sqlorm_core::settings::DEFAULT_DB_ALIAS;
use sqlorm_core::SqlormResult;

use crate::command::{CommandContext, ManagementCommand};

/// Creates the tables of the models file that do not exist yet, without
/// writing migration files. Existing tables are left alone.
pub struct SyncdbCommand;

#[async_trait]
impl ManagementCommand for SyncdbCommand {
    fn name(&self) -> &'static str {
        "syncdb"
    }

    fn help(&self) -> &'static str {
        "Create missing tables without migrations"
    }

    fn add_arguments(&self, cmd: clap::Command) -> clap::Command {
        cmd.arg(
            clap::Arg::new("database")
                .long("database")
                .default_value(DEFAULT_DB_ALIAS)
                .help("Database alias to create tables on"),
        )
    }

    async fn handle(
        &self,
        matches: &clap::ArgMatches,
        context: &CommandContext,
    ) -> SqlormResult<()> {
        let database = matches
            .get_one::<String>("database")
            .map_or(DEFAULT_DB_ALIAS, String::as_str);

        let created = sqlorm::syncdb(database, context.verbosity).await?;
        if context.verbosity > 0 {
            for table in &created {
                println!("Created table: {table}");
            }
            if created.is_empty() {
                println!("All tables exist.");
            }
        }
        Ok(())
    }
}

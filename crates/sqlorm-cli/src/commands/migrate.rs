//! The `migrate` management command.

use async_trait::async_trait;
use sqlorm::MigrateOptions;
use sqlorm_core::apps::SQLORM_APP_LABEL;
use sqlorm_core::settings::DEFAULT_DB_ALIAS;
use sqlorm_core::SqlormResult;

use crate::command::{CommandContext, ManagementCommand};

/// Brings a database to the latest migration, or to a named one.
pub struct MigrateCommand;

#[async_trait]
impl ManagementCommand for MigrateCommand {
    fn name(&self) -> &'static str {
        "migrate"
    }

    fn help(&self) -> &'static str {
        "Apply or unapply migrations"
    }

    fn add_arguments(&self, cmd: clap::Command) -> clap::Command {
        cmd.arg(
            clap::Arg::new("target")
                .help("Migration name or prefix to migrate to; later migrations are unapplied")
                .required(false),
        )
        .arg(
            clap::Arg::new("database")
                .long("database")
                .default_value(DEFAULT_DB_ALIAS)
                .help("Database alias to migrate"),
        )
        .arg(
            clap::Arg::new("fake")
                .long("fake")
                .action(clap::ArgAction::SetTrue)
                .help("Record migrations without running their SQL"),
        )
    }

    async fn handle(
        &self,
        matches: &clap::ArgMatches,
        context: &CommandContext,
    ) -> SqlormResult<()> {
        let options = MigrateOptions {
            alias: matches
                .get_one::<String>("database")
                .map_or_else(|| DEFAULT_DB_ALIAS.to_string(), Clone::clone),
            target: matches.get_one::<String>("target").cloned(),
            fake: matches.get_flag("fake"),
        };

        let migrated = sqlorm::migrate(&options).await?;
        if context.verbosity == 0 {
            return Ok(());
        }
        if migrated.is_empty() {
            println!("No migrations to apply.");
        }
        let suffix = if options.fake { " FAKED" } else { " OK" };
        for name in migrated {
            println!("  {SQLORM_APP_LABEL}.{name}...{suffix}");
        }
        Ok(())
    }
}

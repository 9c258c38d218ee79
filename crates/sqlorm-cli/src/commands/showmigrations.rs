//! The `showmigrations` management command.

use async_trait::async_trait;
use sqlorm_core::apps::SQLORM_APP_LABEL;
use sqlorm_core::settings::DEFAULT_DB_ALIAS;
use sqlorm_core::SqlormResult;

use crate::command::{CommandContext, ManagementCommand};

/// Lists the migrations on disk, marking those the database has applied.
pub struct ShowmigrationsCommand;

/// One line of the listing: `[X] name` when applied, `[ ] name` otherwise.
pub fn status_line(name: &str, applied: bool) -> String {
    let mark = if applied { 'X' } else { ' ' };
    format!(" [{mark}] {name}")
}

#[async_trait]
impl ManagementCommand for ShowmigrationsCommand {
    fn name(&self) -> &'static str {
        "showmigrations"
    }

    fn help(&self) -> &'static str {
        "Show migrations and whether they are applied"
    }

    fn add_arguments(&self, cmd: clap::Command) -> clap::Command {
        cmd.arg(
            clap::Arg::new("database")
                .long("database")
                .default_value(DEFAULT_DB_ALIAS)
                .help("Database alias to check"),
        )
    }

    async fn handle(
        &self,
        matches: &clap::ArgMatches,
        _context: &CommandContext,
    ) -> SqlormResult<()> {
        let database = matches
            .get_one::<String>("database")
            .map_or(DEFAULT_DB_ALIAS, String::as_str);

        let migrations = sqlorm::showmigrations(database).await?;
        println!("{SQLORM_APP_LABEL}");
        if migrations.is_empty() {
            println!(" (no migrations)");
        }
        for (name, applied) in migrations {
            println!("{}", status_line(&name, applied));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_line() {
        assert_eq!(status_line("0001_initial", true), " [X] 0001_initial");
        assert_eq!(status_line("0002_post_views", false), " [ ] 0002_post_views");
    }
}

//! The `inspectdb` management command.
//!
//! Prints a models file describing the tables of a database, which can be
//! fed back to `--models` after review.

use std::path::PathBuf;

use async_trait::async_trait;
use sqlorm_core::settings::DEFAULT_DB_ALIAS;
use sqlorm_core::SqlormResult;

use crate::command::{CommandContext, ManagementCommand};

pub struct InspectdbCommand;

#[async_trait]
impl ManagementCommand for InspectdbCommand {
    fn name(&self) -> &'static str {
        "inspectdb"
    }

    fn help(&self) -> &'static str {
        "Describe existing tables as a models file"
    }

    fn add_arguments(&self, cmd: clap::Command) -> clap::Command {
        cmd.arg(
            clap::Arg::new("database")
                .long("database")
                .default_value(DEFAULT_DB_ALIAS)
                .help("Database alias to inspect"),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Write the models file here instead of stdout"),
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

        let models = sqlorm::inspectdb(database).await?;
        match matches.get_one::<PathBuf>("output") {
            Some(path) => {
                std::fs::write(path, format!("{models}\n"))?;
                if context.verbosity > 0 {
                    println!("Wrote {}", path.display());
                }
            }
            None => println!("{models}"),
        }
        Ok(())
    }
}

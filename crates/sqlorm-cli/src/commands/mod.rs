//! The built-in management commands.

pub mod inspectdb;
pub mod makemigrations;
pub mod migrate;
pub mod showmigrations;
pub mod syncdb;

pub use inspectdb::InspectdbCommand;
pub use makemigrations::MakemigrationsCommand;
pub use migrate::MigrateCommand;
pub use showmigrations::ShowmigrationsCommand;
pub use syncdb::SyncdbCommand;

use crate::command::CommandRegistry;

/// Registers every built-in command.
pub fn register_builtin_commands(registry: &mut CommandRegistry) {
    registry.register(Box::new(MakemigrationsCommand));
    registry.register(Box::new(MigrateCommand));
    registry.register(Box::new(ShowmigrationsCommand));
    registry.register(Box::new(SyncdbCommand));
    registry.register(Box::new(InspectdbCommand));
}

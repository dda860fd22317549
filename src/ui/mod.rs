mod status;
mod table;

pub use status::{print_command_status, CommandStatus};

pub use table::{header, styled_table, truncate};

pub mod error;
pub mod migration;
pub mod operation;
pub mod validation;

pub use error::{Error, Result};
pub use migration::{Migration, MigrationId};
pub use operation::{ChangeOperation, ColumnDef, ForeignKeyDef, OnDelete, SeedRow};
pub use validation::{IdentifierValidator, quote_ident};

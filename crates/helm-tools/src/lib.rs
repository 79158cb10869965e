//! The tool contract shared by the Helm runtime and the tools it federates.

pub mod adapter;
pub mod bounds;
pub mod catalog;
pub mod definition;
pub mod error;
pub mod schema;
pub mod template;

pub use adapter::{AdapterError, PayloadAdapter, ResultAdapter, SidecarAdapter};
pub use bounds::{BOUNDS_FIELD, Bounds};
pub use catalog::{ToolSchemaCatalog, ToolSchemaEntry};
pub use definition::{
    ConfirmationPolicy, ContractError, ExecutionPolicy, ToolDefinition, ToolId, ToolProvider,
    TypedSchema,
};
pub use error::{ErrorKind, ResultCode, ToolError};
pub use schema::{ObjectShape, schema_for};
pub use template::{PromptTemplate, TemplateError};

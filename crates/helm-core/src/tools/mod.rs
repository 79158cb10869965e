//! Tool catalog and dispatch.

mod backend;
mod catalog;
mod executor;
mod mcp;
mod method;
mod registry;

pub use backend::{InvocationContext, ToolBackend, ToolOutput};
pub use catalog::{CatalogEntry, CatalogError, ToolCatalog};
pub use executor::ToolExecutor;
pub use mcp::{McpBackend, McpCallResult, McpClient, McpToolInfo, RmcpClient};
pub use method::{MethodBackend, MethodError, ServiceMethod, ServiceMethodErased};
pub use registry::RegistryBackend;

//! Tool registry, schemas, and built-in tools.

pub mod builtin;
mod registry;
mod schema;
mod simple;

pub use builtin::{
    BUILTIN_TOOL_NAMES, PROCESS_MESSAGE_TOOL, REASONING_TOOL, STOP_TOOL, is_builtin,
    register_builtins,
};
pub use registry::{
    ToolContext, ToolEntry, ToolHandler, ToolRegistry, default_tools, union_active,
};
pub use schema::{
    FunctionSchema, JsonType, ParametersSchema, PropertySchema, validate_args,
};
pub use simple::{SimpleTool, parse_args_doc};

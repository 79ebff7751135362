// src/client/mod.rs

//! The client-side invocation runtime: the invoke adaptor, request
//! tracking, the notification receive loop, and range/function-group
//! creation. Embedded in user processes as a library.

pub mod adaptor;
pub mod group;
pub mod notify;
pub mod request;
pub mod spec;

pub use adaptor::{InvokeAdaptor, ObjRef};
pub use group::FunctionGroup;
pub use request::RequestManager;
pub use spec::{FunctionMeta, InvokeOptions, InvokeSpec, InvokeType};

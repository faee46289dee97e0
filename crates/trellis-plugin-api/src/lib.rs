//! # Trellis Plugin API
//!
//! The surface shared between the Trellis host and its plugins:
//!
//! - the [`registration`] model a plugin publishes (routes, menu items,
//!   widgets, jobs, templates, translations, error codes, resources);
//! - [`policy`]: requested permissions and the platform-side resource
//!   policies that narrow them;
//! - the [`host::HostApi`] capability trait plugins consume;
//! - the [`plugin::Plugin`] trait every transport implements host-side;
//! - the [`rpc`] wire protocol for out-of-process plugins;
//! - the [`sdk`] plugin authors build executables with.

pub mod host;
pub mod plugin;
pub mod policy;
pub mod registration;
pub mod rpc;
pub mod sdk;

pub use host::{CallContext, HostApi, HttpResponse, LogLevel, MAX_CALL_DEPTH, Row};
pub use plugin::Plugin;
pub use policy::{
    AccessLevel, Permission, PermissionType, PolicyStatus, ResourcePolicy, ResourceRequest,
};
pub use registration::{
    ErrorCodeSpec, JobSpec, MenuItem, Registration, RouteSpec, TemplateSpec, TranslationBundle,
    WidgetSpec,
};

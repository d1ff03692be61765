// ABOUTME: Core library for aviso: records, key templates, type handlers, schemas and config.
// ABOUTME: Shared by the store adapter, the listener engine and the publish path.

pub mod config;
pub mod notification;
pub mod record;
pub mod schema;
pub mod template;
pub mod types;

pub use config::{AuthConfig, AvisoConfig, ConfigError, EngineKind};
pub use notification::{Notification, NotificationKeys, derive_notification_keys};
pub use record::{KeyValueRecord, Revision, StatusRecord};
pub use schema::{EventSchema, Schema, SchemaError};
pub use template::{KeyTemplate, TemplateError, split_bracket_list};
pub use types::{AttributeRule, Pattern, TypeError, TypeHandler};

//! Shared domain types for gchat: models, request/response shapes, field
//! validation and page arithmetic. Nothing here touches I/O.

pub mod api;
pub mod models;
pub mod pagination;
pub mod validator;

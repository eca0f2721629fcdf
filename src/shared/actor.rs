//! Caller identity for audited operations.
//!
//! The upstream API edge authenticates requests and forwards the caller's
//! role and id in headers; the core only enforces role gates and stamps
//! history rows. An absent role header means a customer-facing call.

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::shared::error::ApiError;

const ROLE_HEADER: &str = "x-actor-role";
const ID_HEADER: &str = "x-actor-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorRole {
    Customer,
    Staff,
    Owner,
    Admin,
}

impl ActorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Staff => "staff",
            Self::Owner => "owner",
            Self::Admin => "admin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "customer" => Some(Self::Customer),
            "staff" => Some(Self::Staff),
            "owner" => Some(Self::Owner),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Actor {
    pub role: ActorRole,
    pub id: Option<Uuid>,
}

impl Actor {
    /// Staff-side operations: completing, marking no-show.
    pub fn can_manage(&self) -> bool {
        matches!(self.role, ActorRole::Staff | ActorRole::Owner | ActorRole::Admin)
    }

    /// Money-moving operations: manual refunds.
    pub fn can_refund(&self) -> bool {
        matches!(self.role, ActorRole::Owner | ActorRole::Admin)
    }

    /// Actor string stamped into booking history.
    pub fn label(&self) -> String {
        match self.id {
            Some(id) => format!("{}:{id}", self.role.as_str()),
            None => self.role.as_str().to_string(),
        }
    }

    pub fn require_manage(&self) -> Result<(), ApiError> {
        if self.can_manage() {
            Ok(())
        } else {
            Err(ApiError::Forbidden(
                "this operation requires a staff, owner or admin actor".to_string(),
            ))
        }
    }

    pub fn require_refund(&self) -> Result<(), ApiError> {
        if self.can_refund() {
            Ok(())
        } else {
            Err(ApiError::Forbidden(
                "refunds require an owner or admin actor".to_string(),
            ))
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let role = match parts.headers.get(ROLE_HEADER) {
            None => ActorRole::Customer,
            Some(value) => {
                let value = value
                    .to_str()
                    .map_err(|_| ApiError::BadRequest("unreadable actor role header".to_string()))?;
                ActorRole::parse(value).ok_or_else(|| {
                    ApiError::BadRequest(format!("unknown actor role '{value}'"))
                })?
            }
        };
        let id = match parts.headers.get(ID_HEADER) {
            None => None,
            Some(value) => {
                let value = value
                    .to_str()
                    .map_err(|_| ApiError::BadRequest("unreadable actor id header".to_string()))?;
                Some(Uuid::parse_str(value).map_err(|_| {
                    ApiError::BadRequest("actor id header is not a UUID".to_string())
                })?)
            }
        };
        Ok(Actor { role, id })
    }
}

//! Authorization predicates attached to route registrations.
//!
//! A route with no predicates is open. Otherwise the call proceeds when at least
//! one predicate accepts the caller's context.

use crate::context::Context;
use std::sync::Arc;

/// Predicate deciding whether a call may reach its handler.
pub type Authorizer = Arc<dyn Fn(&Context) -> bool + Send + Sync>;

/// Rejects every caller.
pub fn deny_all() -> Authorizer {
    Arc::new(|_| false)
}

/// Accepts every caller, authenticated or not.
pub fn is_anonymous() -> Authorizer {
    Arc::new(|_| true)
}

/// Accepts callers that carry an identity.
pub fn is_authenticated() -> Authorizer {
    Arc::new(|ctx| ctx.user_info().is_some())
}

/// Accepts callers whose role is one of `roles`.
///
/// An empty role list denies everyone, as does a caller without identity or role.
pub fn secured<I, S>(roles: I) -> Authorizer
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let roles: Vec<String> = roles.into_iter().map(Into::into).collect();
    Arc::new(move |ctx| {
        let Some(user) = ctx.user_info() else {
            return false;
        };
        roles.iter().any(|role| user.has_role(role))
    })
}

pub(crate) fn is_authorized(ctx: &Context, authorizers: &[Authorizer]) -> bool {
    authorizers.is_empty() || authorizers.iter().any(|allow| allow(ctx))
}

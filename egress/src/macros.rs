//! Macros for egress error handling.

/// Creates an [`crate::error::EgressError`] from error kind and description.
#[macro_export]
macro_rules! egress_error {
    ($kind:expr, $desc:expr) => {
        EgressError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        EgressError::from(($kind, $desc, $detail.to_string()))
    };
}

/// Creates and returns an [`crate::error::EgressError`] from the current
/// function.
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return Err($crate::egress_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return Err($crate::egress_error!($kind, $desc, $detail))
    };
}

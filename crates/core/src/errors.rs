use thiserror::Error;

use crate::domain::order::OrderId;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("order {order_id} was not found")]
    OrderNotFound { order_id: OrderId },
    #[error("order {order_id} has already been returned")]
    OrderAlreadyReturned { order_id: OrderId },
    #[error(
        "order {order_id} was delivered {days_since_delivery} days ago, outside the {window_days}-day return window"
    )]
    OutsideReturnWindow { order_id: OrderId, days_since_delivery: i64, window_days: u32 },
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

impl DomainError {
    /// Text suitable for showing to the customer; these are outcomes, not faults.
    pub fn user_message(&self) -> String {
        match self {
            Self::OrderNotFound { order_id } => {
                format!("I could not find an order with the number {order_id}.")
            }
            Self::OrderAlreadyReturned { order_id } => {
                format!("Order {order_id} is already registered as returned.")
            }
            Self::OutsideReturnWindow { order_id, days_since_delivery, window_days } => format!(
                "Order {order_id} was delivered {days_since_delivery} days ago, which is past the {window_days}-day return window."
            ),
            Self::InvariantViolation(_) => {
                "That request could not be completed as stated.".to_string()
            }
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        match value {
            ApplicationError::Domain(error) => Self::BadRequest {
                message: error.to_string(),
                correlation_id: "unassigned".to_owned(),
            },
            ApplicationError::Persistence(message) => {
                Self::ServiceUnavailable { message, correlation_id: "unassigned".to_owned() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::order::OrderId;
    use crate::errors::{ApplicationError, DomainError, InterfaceError};

    #[test]
    fn domain_error_maps_to_bad_request_interface_error() {
        let interface = ApplicationError::from(DomainError::InvariantViolation(
            "empty message".to_owned(),
        ))
        .into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest {
                ref correlation_id,
                ..
            } if correlation_id == "req-1"
        ));
    }

    #[test]
    fn bad_request_has_user_safe_message() {
        let interface = ApplicationError::from(DomainError::InvariantViolation(
            "empty message".to_owned(),
        ))
        .into_interface("req-2");

        assert_eq!(
            interface.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
    }

    #[test]
    fn persistence_error_maps_to_service_unavailable() {
        let interface = ApplicationError::Persistence("session store lock timeout".to_owned())
            .into_interface("req-3");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(interface.correlation_id(), "req-3");
        assert_eq!(
            interface.user_message(),
            "The service is temporarily unavailable. Please retry shortly."
        );
    }

    #[test]
    fn order_outcomes_render_customer_facing_text() {
        let order_id = OrderId("e481f51cbdc54678b7cc49136f2d6af7".to_string());
        let already = DomainError::OrderAlreadyReturned { order_id: order_id.clone() };
        assert!(already.user_message().contains("already registered as returned"));

        let window = DomainError::OutsideReturnWindow {
            order_id,
            days_since_delivery: 45,
            window_days: 30,
        };
        assert!(window.user_message().contains("45 days ago"));
        assert!(window.to_string().contains("30-day return window"));
    }
}

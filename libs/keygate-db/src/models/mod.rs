pub mod store;

pub use store::{Entitlement, Payment, PaymentPurpose, PaymentStatus, User};

pub mod entitlement_repo;
pub mod payment_repo;
pub mod user_repo;

pub use entitlement_repo::EntitlementRepository;
pub use payment_repo::PaymentRepository;
pub use user_repo::UserRepository;

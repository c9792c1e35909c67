// Error taxonomy shared across layers
pub mod error;

// Durable key-value store and change notifications
pub mod store;

// Authenticated encryption and master-key lifecycle
pub mod crypto;

// Credential record persistence and validation
pub mod credentials;

// Legacy-secret migration engine
pub mod migration;

// OAuth2 session client and entries API
pub mod session;

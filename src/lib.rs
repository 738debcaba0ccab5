//! WAMP client
//!
//! A client for the Web Application Messaging Protocol session layer. It
//! joins a realm on a router, subscribes to topics and publishes events, and
//! reconnects with exponential backoff when the transport drops.
//!
//! # Example
//!
//! ```no_run
//! use wamp_client::{Connection, ConnectionConfig, Dict};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConnectionConfig::new("ws://127.0.0.1:8080/ws", "realm1");
//!     let connection = Connection::new(config);
//!
//!     connection.on_join(|session, details| {
//!         println!("Joined session {:?}: {:?}", session.id(), details);
//!
//!         // Subscribe to events
//!         let _ = session.subscribe(
//!             "com.example.status",
//!             |args, kwargs, details| println!("Event {:?} {:?} {:?}", args, kwargs, details),
//!             Dict::new(),
//!             |result| match result {
//!                 Ok(subscription) => println!("Subscribed with id {}", subscription.id()),
//!                 Err(e) => eprintln!("Subscribe failed: {}", e.error),
//!             },
//!         );
//!
//!         // Publish with acknowledgement
//!         let mut options = Dict::new();
//!         options.insert("acknowledge".to_string(), json!(true));
//!         let _ = session.publish(
//!             "com.example.status",
//!             Some(vec![json!("running")]),
//!             None,
//!             options,
//!             |result| println!("Published: {:?}", result.map(|p| p.publication)),
//!         );
//!     });
//!
//!     connection.on_disconnect(|reason| println!("Disconnected: {}", reason));
//!
//!     connection.open()?;
//!     connection.stopped().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod scheduler;
pub mod serializer;
pub mod session;
pub mod transport;
pub mod uri;

pub use config::{ConnectionConfig, DEFAULT_PROTOCOL};
pub use connection::Connection;
pub use error::{Result, WampError};
pub use message::{Dict, Id, List, Message, MessageType};
pub use scheduler::{ScheduledTask, Scheduler, TokioScheduler};
pub use serializer::{JsonSerializer, Serializer};
pub use session::{
    Publication, PublishRequest, RequestError, Session, SessionHandlers, SubscribeRequest,
    Subscription,
};
pub use transport::{Transport, TransportFactory, TransportHandlers, WebSocketTransport};

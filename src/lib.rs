pub mod audio;
pub mod bus;
pub mod codec;
pub mod command;
pub mod connection;
pub mod datatypes;
pub mod media;
pub mod server;
pub mod viewer;


// Re-export the wire types for direct access
pub use codec::{BinaryFrameHeader, CodecError, ControlMessage};
pub use connection::{Connection, WireEvent};

// Re-export the buses and the two main roles
pub use bus::{FrameBus, FrameBusStats};
pub use command::{CommandBus, StreamCommand};
pub use server::{ProducerHandle, ServerHandle, StreamServer};
pub use viewer::{ViewerClient, ViewerError, ViewerHandle};

/// Error returned by most functions.
///
/// When writing a real application, one might want to consider a
/// specialized error handling crate or defining an error type as an
/// `enum` of causes. However, using a boxed `std::error::Error` is
/// sufficient at the seams between the core and its collaborators.
///
/// For performance reasons, boxing is avoided in any hot path. The wire
/// codec and the viewer define their own `enum` errors (`CodecError`,
/// `ViewerError`) because those are hit and handled during normal
/// execution, e.g. when a partial frame is received on a socket.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for streaming-core operations.
///
/// This is defined as a convenience.
///
/// # Examples
///
/// Running a primary with a hardware encoder seam and shutting it down:
///
/// ```rust,no_run
/// use lookout::StreamServer;
/// use lookout::datatypes::ServerConfig;
/// # fn make_encoder() -> Box<dyn lookout::media::Encoder> { unimplemented!() }
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
///     let server = StreamServer::bind(ServerConfig::new("123456"), make_encoder()).await?;
///
///     // The encoder output task feeds frames through this handle.
///     let producer = server.producer();
///     let admin = server.handle();
///
///     tokio::spawn(async move {
///         // ... push encoded frames ...
///         let _ = producer.current_epoch();
///     });
///     tokio::spawn(server.run());
///
///     // ... later, from the app layer:
///     admin.shutdown();
///     Ok(())
/// }
/// ```
///
/// Connecting a viewer and reacting to its state:
///
/// ```rust,no_run
/// use lookout::ViewerClient;
/// use lookout::datatypes::{ConnectionState, ViewerConfig};
/// # fn make_sink() -> Box<dyn lookout::media::VideoSink> { unimplemented!() }
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ViewerConfig::new("192.168.1.50", "123456");
///     let (client, mut handle) = ViewerClient::new(config, make_sink());
///
///     tokio::spawn(client.run());
///
///     handle.wait_for_state(ConnectionState::Streaming).await;
///     println!("video is flowing");
///     handle.shutdown();
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

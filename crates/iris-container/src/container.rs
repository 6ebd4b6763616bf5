//! The service container (C7): owns the listener, the connection table, the pending-call
//! table, and every installed service; runs the receive loop and dispatches inbound traffic.
use std::collections::HashMap;
use std::os::unix::io::FromRawFd;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use futures::StreamExt;
use rand::Rng;
use serde_json::Value;
use sha2::Digest;
use slog::debug;
use slog::info;
use slog::warn;
use slog::Logger;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

use iris_events::Event;
use iris_events::EventSystem;
use iris_events::Pattern;
use iris_message::Message;
use iris_message::MessageCodec;
use iris_message::MessageKind;
use iris_registry::ServiceRegistry;
use iris_trace::Headers;

use crate::channel::PendingTable;
use crate::channel::ReplyChannel;
use crate::channel::RequestChannel;
use crate::config::Config;
use crate::config::RANDOM_PORT_RANGE_START;
use crate::connection::ConnectionTable;
use crate::error::Error;
use crate::error::Result;
use crate::service::ServiceInterface;

/// Context passed to an error hook when a request handler returns an error.
pub struct ErrorContext {
    pub service_type: String,
    pub method: String,
    pub error: String,
}

/// A sequence of total callbacks invoked when a request handler errors. Hooks must not panic;
/// they are not an exception channel (§9).
#[derive(Default)]
struct ErrorHook(Mutex<Vec<Box<dyn Fn(&ErrorContext) + Send + Sync>>>);

impl ErrorHook {
    fn register<F>(&self, f: F)
    where
        F: Fn(&ErrorContext) + Send + Sync + 'static,
    {
        self.0.lock().expect("error hook poisoned").push(Box::new(f));
    }

    fn fire(&self, context: &ErrorContext) {
        for hook in self.0.lock().expect("error hook poisoned").iter() {
            hook(context);
        }
    }
}

struct Inner {
    identity: String,
    endpoint: String,
    listener: Mutex<Option<TcpListener>>,
    connections: Arc<ConnectionTable>,
    pending: Arc<PendingTable>,
    services: Mutex<Vec<Arc<dyn ServiceInterface>>>,
    service_index: Mutex<HashMap<String, usize>>,
    registry: Arc<dyn ServiceRegistry>,
    events: Arc<dyn EventSystem>,
    config: Config,
    running: AtomicBool,
    error_hook: ErrorHook,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    logger: Logger,
}

/// The runtime host for one or more installed [`ServiceInterface`]s on a node.
///
/// Cheaply cloneable: every clone shares the same underlying state.
#[derive(Clone)]
pub struct Container(Arc<Inner>);

fn compute_identity(endpoint: &str) -> String {
    let digest = sha2::Sha256::digest(endpoint.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Look up `port` in the `IRIS_SHARED_SOCKET_FDS` environment map (`{"<port>": <fd>}`), the
/// mechanism a process supervisor uses to hand a container an already-bound listener across a
/// restart. Returns `Ok(None)` when the variable is unset (bind fresh, as normal); a variable
/// that is set but missing the requested port is `Err(Error::SocketNotCreated)`, since the
/// environment has explicitly opted into shared sockets but has nothing for this one.
fn adopt_shared_socket(port: u16) -> Result<Option<TcpListener>> {
    let raw = match std::env::var("IRIS_SHARED_SOCKET_FDS") {
        Ok(raw) => raw,
        Err(_) => return Ok(None),
    };
    let fds: HashMap<String, i32> = serde_json::from_str(&raw)
        .map_err(|e| Error::SocketNotCreated(format!("malformed IRIS_SHARED_SOCKET_FDS: {e}")))?;
    let fd = fds
        .get(&port.to_string())
        .copied()
        .ok_or_else(|| Error::SocketNotCreated(format!("no shared socket fd advertised for port {port}")))?;
    // Safety: the fd is supplied by the process supervisor that execed us, which is
    // contractually required to hand over a valid, open, bound-and-listening TCP socket keyed
    // by this exact port.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener
        .set_nonblocking(true)
        .map_err(|e| Error::SocketNotCreated(e.to_string()))?;
    let listener = TcpListener::from_std(std_listener).map_err(|e| Error::SocketNotCreated(e.to_string()))?;
    Ok(Some(listener))
}

async fn bind_listener(config: &Config) -> Result<(TcpListener, String)> {
    if let Some(port) = config.port {
        if let Some(listener) = adopt_shared_socket(port)? {
            let addr = listener
                .local_addr()
                .map_err(|e| Error::SocketNotCreated(e.to_string()))?;
            return Ok((listener, format!("tcp://{addr}")));
        }
    }

    let mut attempt: u32 = 0;
    loop {
        let port = config.port.unwrap_or_else(|| {
            rand::thread_rng().gen_range(RANDOM_PORT_RANGE_START..u16::MAX)
        });
        match TcpListener::bind((config.host.as_str(), port)).await {
            Ok(listener) => {
                let addr = listener
                    .local_addr()
                    .map_err(|e| Error::SocketNotCreated(e.to_string()))?;
                return Ok((listener, format!("tcp://{addr}")));
            }
            Err(error) if error.kind() == std::io::ErrorKind::AddrInUse => {
                if attempt >= config.max_retries {
                    let requested = config
                        .port
                        .map(|p| format!("{}:{}", config.host, p))
                        .unwrap_or_else(|| "<random port>".to_string());
                    return Err(Error::AddressInUse(requested));
                }
                attempt += 1;
                if config.retry_delay_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(config.retry_delay_ms)).await;
                }
            }
            Err(error) => return Err(Error::SocketNotCreated(error.to_string())),
        }
    }
}

impl Container {
    /// Bind a new container. Retries on `AddrInUse` per [`Config::max_retries`]; any other bind
    /// failure is fatal.
    pub async fn bind(
        config: Config,
        registry: Arc<dyn ServiceRegistry>,
        events: Arc<dyn EventSystem>,
        logger: Logger,
    ) -> Result<Container> {
        let (listener, endpoint) = bind_listener(&config).await?;
        let identity = compute_identity(&endpoint);
        info!(logger, "container bound"; "endpoint" => &endpoint, "identity" => &identity);
        Ok(Container(Arc::new(Inner {
            identity,
            endpoint,
            listener: Mutex::new(Some(listener)),
            connections: Arc::new(ConnectionTable::new()),
            pending: PendingTable::new(),
            services: Mutex::new(Vec::new()),
            service_index: Mutex::new(HashMap::new()),
            registry,
            events,
            config,
            running: AtomicBool::new(false),
            error_hook: ErrorHook::default(),
            tasks: Mutex::new(Vec::new()),
            logger,
        })))
    }

    pub fn endpoint(&self) -> &str {
        &self.0.endpoint
    }

    pub fn identity(&self) -> &str {
        &self.0.identity
    }

    pub fn is_running(&self) -> bool {
        self.0.running.load(Ordering::SeqCst)
    }

    pub fn connection_stats(&self) -> Vec<crate::connection::ConnectionStats> {
        self.0.connections.stats()
    }

    /// Register a callback invoked whenever a request handler returns an error.
    pub fn on_handler_error<F>(&self, f: F)
    where
        F: Fn(&ErrorContext) + Send + Sync + 'static,
    {
        self.0.error_hook.register(f);
    }

    /// Install a service. Must be called before [`Container::start`]; rejects a duplicate
    /// `service_type`.
    pub fn install(&self, service: Arc<dyn ServiceInterface>) -> Result<()> {
        let service_type = service.service_type().to_string();
        let mut index = self.0.service_index.lock().expect("service_index poisoned");
        if index.contains_key(&service_type) {
            return Err(Error::DuplicateService(service_type));
        }
        let mut services = self.0.services.lock().expect("services poisoned");
        index.insert(service_type, services.len());
        services.push(service);
        Ok(())
    }

    /// Alias for [`Container::install`] used for plugin-flavoured services, kept distinct at
    /// the API boundary even though installation mechanics are identical.
    pub fn install_plugin(&self, plugin: Arc<dyn ServiceInterface>) -> Result<()> {
        self.install(plugin)
    }

    fn services_snapshot(&self) -> Vec<Arc<dyn ServiceInterface>> {
        self.0.services.lock().expect("services poisoned").clone()
    }

    async fn fire_on_connect(&self, endpoint: &str) {
        for service in self.services_snapshot() {
            service.on_connect(endpoint).await;
        }
    }

    async fn fire_on_disconnect(&self, endpoint: &str) {
        for service in self.services_snapshot() {
            service.on_disconnect(endpoint).await;
        }
    }

    /// Start the container: spawn the receive loop, bring up the registry and event system,
    /// start every installed service, optionally register them, and finally install declared
    /// event subscriptions.
    ///
    /// Subscriptions are installed last, after every service's `on_start`/`configure` — matching
    /// the source system's own ordering. An event emitted synchronously from one of those hooks
    /// can therefore be missed; this is a known, documented race (see SPEC_FULL.md §9), not an
    /// oversight.
    pub async fn start(&self) -> Result<()> {
        let listener = self
            .0
            .listener
            .lock()
            .expect("listener poisoned")
            .take()
            .ok_or_else(|| Error::SocketNotCreated("container already started".to_string()))?;
        self.spawn_receive_loop(listener);
        self.0.running.store(true, Ordering::SeqCst);

        self.0.registry.on_start().await?;
        self.0.events.on_start().await?;

        for service in self.services_snapshot() {
            service.on_start().await?;
            service.configure(Value::Object(Default::default())).await?;
        }

        if self.0.config.register {
            for service in self.services_snapshot() {
                if !service.register_with_coordinator() {
                    continue;
                }
                if let Err(error) = self.0.registry.register(service.service_type(), &self.0.endpoint).await {
                    let error: Error = error.into();
                    self.stop().await;
                    return Err(error);
                }
            }
        }

        self.spawn_event_dispatch_loop().await?;
        Ok(())
    }

    fn spawn_receive_loop(&self, listener: TcpListener) {
        let (frame_tx, mut frame_rx) =
            tokio::sync::mpsc::unbounded_channel::<std::result::Result<Message, iris_message::Error>>();

        let accept_logger = self.0.logger.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let tx = frame_tx.clone();
                        tokio::spawn(async move {
                            let mut reader = FramedRead::new(stream, MessageCodec::default());
                            while let Some(result) = reader.next().await {
                                if tx.send(result).is_err() {
                                    break;
                                }
                            }
                        });
                    }
                    Err(error) => {
                        debug!(accept_logger, "accept loop stopping"; "error" => %error);
                        break;
                    }
                }
            }
        });

        let container = self.clone();
        let dispatch_task = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                match frame {
                    Err(error) => {
                        crate::metrics::BAD_FRAMES_TOTAL.inc();
                        warn!(container.0.logger, "dropping malformed frame"; "error" => %error);
                    }
                    Ok(message) => container.dispatch_inbound(message).await,
                }
            }
        });

        let mut tasks = self.0.tasks.lock().expect("tasks poisoned");
        tasks.push(accept_task);
        tasks.push(dispatch_task);
    }

    async fn spawn_event_dispatch_loop(&self) -> Result<()> {
        let mut subscription = self.0.events.subscribe(Pattern::new("*"));
        self.0.events.sync_subscriptions().await?;
        let container = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match subscription.recv().await {
                    Ok(event) => container.dispatch_event(event).await,
                    Err(_) => break,
                }
            }
        });
        self.0.tasks.lock().expect("tasks poisoned").push(task);
        Ok(())
    }

    async fn dispatch_inbound(&self, message: Message) {
        let headers = message.headers.clone();
        iris_trace::from_headers(&headers, async {
            let endpoint = self.0.endpoint.clone();
            let source = message.source.clone();
            if let Err(error) = self
                .0
                .connections
                .record_recv(&source, || self.fire_on_connect(&source))
                .await
            {
                debug!(self.0.logger, "could not establish return connection"; "peer" => &source, "error" => %error);
            }
            match message.kind {
                MessageKind::Req => self.dispatch_request(message, endpoint).await,
                MessageKind::Rep | MessageKind::Ack | MessageKind::Nack | MessageKind::Err => {
                    if !self.0.pending.deliver(&message.subject, message.clone()) {
                        debug!(self.0.logger, "dropping reply for unknown subject"; "subject" => &message.subject);
                    }
                }
            }
        })
        .await
    }

    async fn dispatch_request(&self, message: Message, endpoint: String) {
        let (service_name, method) = match message.subject.rsplit_once('.') {
            Some((service_name, method)) => (service_name.to_string(), method.to_string()),
            None => {
                warn!(self.0.logger, "request subject missing method separator"; "subject" => &message.subject);
                return;
            }
        };
        let service = {
            let index = self.0.service_index.lock().expect("service_index poisoned");
            let services = self.0.services.lock().expect("services poisoned");
            index.get(&service_name).map(|i| services[*i].clone())
        };
        let service = match service {
            Some(service) => service,
            None => {
                warn!(self.0.logger, "unsupported service type"; "service_type" => &service_name);
                return;
            }
        };

        let connections = Arc::downgrade(&self.0.connections);
        let error_hook_container = self.clone();
        let logger = self.0.logger.clone();
        iris_trace::spawn(async move {
            let channel = RequestChannel::new(message, endpoint, connections);
            if let Err(error) = service.handle_request(&method, &channel).await {
                error_hook_container.0.error_hook.fire(&ErrorContext {
                    service_type: service.service_type().to_string(),
                    method: method.clone(),
                    error: error.to_string(),
                });
                if !channel.is_closed() {
                    if let Err(nack_error) = channel.nack(true).await {
                        warn!(logger, "failed to send automatic NACK"; "error" => %nack_error);
                    }
                }
                crate::metrics::REQUESTS_NACKED_TOTAL.inc();
            }
        });
    }

    async fn dispatch_event(&self, event: Event) {
        let services = self.services_snapshot();
        let mut handled = false;
        for service in services {
            let matches = service.subscriptions().iter().any(|pattern| pattern.matches(&event.event_type));
            if matches && service.dispatch_event(&event).await {
                handled = true;
            }
        }
        if !handled {
            debug!(self.0.logger, "event not handled by any installed service"; "event_type" => &event.event_type);
        }
    }

    /// Connect (or reuse an existing connection) to `endpoint`.
    pub async fn connect(&self, endpoint: &str) -> Result<()> {
        self.0
            .connections
            .connect(endpoint, || self.fire_on_connect(endpoint))
            .await?;
        Ok(())
    }

    pub async fn disconnect(&self, endpoint: &str, hard: bool) {
        self.0.connections.disconnect(endpoint, hard).await;
        self.fire_on_disconnect(endpoint).await;
    }

    async fn resolve_address(&self, address: &str) -> Result<String> {
        match address.strip_prefix("iris://") {
            Some(service_type) => {
                let instance = self.0.registry.get(service_type).await?;
                instance
                    .next_address()
                    .map(str::to_string)
                    .ok_or_else(|| Error::LookupFailure(service_type.to_string(), "no known endpoints".to_string()))
            }
            None => Ok(address.to_string()),
        }
    }

    /// Send `message` to `address` (either a raw `tcp://` endpoint or an `iris://<service_type>`
    /// logical address resolved through the registry). Dropped with a log line, not an error,
    /// when the container is not running.
    pub async fn send_message(&self, address: &str, message: Message) -> Result<()> {
        if !self.is_running() {
            warn!(self.0.logger, "dropping outbound message: container not running"; "address" => address);
            return Ok(());
        }
        let endpoint = self.resolve_address(address).await?;
        self.0
            .connections
            .connect(&endpoint, || self.fire_on_connect(&endpoint))
            .await?;
        self.0.connections.send(&endpoint, message).await
    }

    /// Build and dispatch a request, returning the [`ReplyChannel`] to await its response on.
    pub async fn send_request(
        &self,
        address: &str,
        subject: &str,
        body: Value,
        headers: Option<Headers>,
    ) -> Result<ReplyChannel> {
        let mut message = Message::request(subject, self.0.endpoint.clone(), body);
        if let Some(headers) = headers {
            message.headers = headers;
        }
        let channel = self.0.pending.register(message.clone());
        self.send_message(address, message).await?;
        Ok(channel)
    }

    /// Send a response correlated with `request`.
    pub async fn send_reply(
        &self,
        request: &Message,
        body: Value,
        kind: MessageKind,
        headers: Option<Headers>,
    ) -> Result<()> {
        let mut message = match kind {
            MessageKind::Rep => Message::reply(request, self.0.endpoint.clone(), body),
            MessageKind::Ack => Message::ack(request, self.0.endpoint.clone()),
            MessageKind::Nack => {
                let requeue = body.get("requeue").and_then(Value::as_bool).unwrap_or(false);
                Message::nack(request, self.0.endpoint.clone(), requeue)
            }
            MessageKind::Err => {
                let kind = body.get("kind").and_then(Value::as_str).unwrap_or("error").to_string();
                let detail = body.get("detail").and_then(Value::as_str).unwrap_or("").to_string();
                Message::error(request, self.0.endpoint.clone(), &kind, detail)
            }
            MessageKind::Req => return Err(Error::LookupFailure(request.id.clone(), "cannot reply with Req".to_string())),
        };
        if let Some(headers) = headers {
            message.headers = headers;
        }
        self.send_message(&request.source, message).await
    }

    /// Publish `event_type`/`payload` as an event sourced from this container's identity.
    pub async fn emit_event(&self, event_type: impl Into<String>, payload: Value) -> Result<()> {
        let event = Event::new(event_type, self.0.identity.clone(), payload);
        self.0.events.emit(event).await.map_err(Error::from)
    }

    /// Reverse-ordered teardown: every step is isolated so one failure does not block the rest.
    /// Safe to call more than once.
    pub async fn stop(&self) {
        if !self.0.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(self.0.logger, "container stopping"; "endpoint" => &self.0.endpoint);

        for service in self.services_snapshot().into_iter().rev() {
            if let Err(error) = service.on_stop().await {
                warn!(self.0.logger, "service on_stop failed"; "service_type" => service.service_type(), "error" => %error);
            }
        }
        if let Err(error) = self.0.events.on_stop().await {
            warn!(self.0.logger, "event system on_stop failed"; "error" => %error);
        }
        if let Err(error) = self.0.registry.on_stop().await {
            warn!(self.0.logger, "registry on_stop failed"; "error" => %error);
        }

        for task in self.0.tasks.lock().expect("tasks poisoned").drain(..) {
            task.abort();
        }
        self.0.connections.disconnect_all().await;
    }
}

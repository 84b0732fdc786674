use authgate_utils::{
    load_config_or_default, AuthPipeline, ConfigStore, ConnectionState, HookEvent, HookTable,
    OriginAuth, Transaction, Verifiers,
};
use std::{
    error::Error,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    io::{
        split, AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
        BufReader,
    },
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const CONFIG_PATH: &str = "authgate.toml";

/// Upper bound on a single read while receiving DATA, longer lines are
/// consumed in several pieces.
const DATA_CHUNK: u64 = 8192;

type SessionResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Represents a single SMTP session, created for each incoming connection.
///
/// Holds the connection state the authentication hooks operate on,
/// together with the hook table they are dispatched through.
struct SMTPSession {
    connection: ConnectionState,
    hooks: Arc<HookTable>,
    authserv_id: String,
    max_message_size: usize,
}

impl SMTPSession {
    pub fn new(remote_ip: IpAddr, hooks: Arc<HookTable>, config: &ConfigStore) -> Self {
        let snapshot = config.snapshot();
        let hostname = snapshot.config.smtp.hostname.clone();
        Self {
            connection: ConnectionState::new(remote_ip, &hostname),
            hooks,
            authserv_id: hostname,
            max_message_size: snapshot.config.smtp.max_message_size,
        }
    }

    /// Base handler for the SMTP commands, returns `false` once the
    /// session should end.
    pub async fn handle_command<R: AsyncRead + AsyncBufRead + Unpin, W: AsyncWrite + Unpin>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        tx: &mpsc::Sender<Transaction>,
        command: &str,
        arg: Option<&str>,
    ) -> Result<bool, Box<dyn Error + Send + Sync>> {
        match command {
            "EHLO" | "HELO" => self.handle_ehlo_helo(writer, command, arg).await,
            "MAIL" => self.handle_mail(writer, arg).await,
            "RCPT" => self.handle_rcpt(writer, arg).await,
            "DATA" => self.handle_data(reader, writer, tx).await?,
            "RSET" => {
                self.connection.end_transaction();
                self.write_response(writer, 250, "OK").await;
            }
            "NOOP" => self.write_response(writer, 250, "OK").await,
            "QUIT" => {
                self.write_response(writer, 221, "Bye").await;
                return Ok(false);
            }
            _ => {
                self.write_response(writer, 502, "Command not implemented")
                    .await;
            }
        }
        Ok(true)
    }

    async fn handle_ehlo_helo<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        command: &str,
        arg: Option<&str>,
    ) {
        let Some(hostname) = arg.filter(|hostname| !hostname.is_empty()) else {
            self.write_response(writer, 501, "Syntax error in parameters or arguments")
                .await;
            return;
        };

        let event = HookEvent::Greeting {
            hostname: hostname.to_string(),
        };
        self.hooks.dispatch(&mut self.connection, &event).await;

        let greeting = format!("{} greets {hostname}", self.authserv_id);
        if command == "EHLO" {
            let size = format!("SIZE {}", self.max_message_size);
            self.write_multiple(writer, 250, &[greeting.as_str(), "8BITMIME", size.as_str()])
                .await;
        } else {
            self.write_response(writer, 250, &greeting).await;
        }
    }

    async fn handle_mail<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, arg: Option<&str>) {
        let Some(sender) = arg.and_then(|value| parse_path(value, "FROM:")) else {
            self.write_response(writer, 501, "Syntax error in parameters or arguments")
                .await;
            return;
        };

        self.connection.begin_transaction(&sender);
        let event = HookEvent::SenderDeclared { sender };
        self.hooks.dispatch(&mut self.connection, &event).await;
        self.write_response(writer, 250, "OK").await;
    }

    async fn handle_rcpt<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, arg: Option<&str>) {
        if self.connection.transaction.is_none() {
            self.write_response(writer, 503, "Need MAIL command").await;
            return;
        }
        let recipient = arg
            .and_then(|value| parse_path(value, "TO:"))
            .filter(|recipient| !recipient.is_empty());
        match (recipient, self.connection.transaction.as_mut()) {
            (Some(recipient), Some(transaction)) => {
                transaction.recipients.push(recipient);
                self.write_response(writer, 250, "OK").await;
            }
            _ => {
                self.write_response(writer, 501, "Syntax error in parameters or arguments")
                    .await;
            }
        }
    }

    async fn handle_data<R: AsyncRead + AsyncBufRead + Unpin, W: AsyncWrite + Unpin>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        tx: &mpsc::Sender<Transaction>,
    ) -> SessionResult {
        match self.connection.transaction.as_ref() {
            None => {
                self.write_response(writer, 503, "Need MAIL command").await;
                return Ok(());
            }
            Some(transaction) if transaction.recipients.is_empty() => {
                self.write_response(writer, 554, "No valid recipients")
                    .await;
                return Ok(());
            }
            Some(_) => {}
        }

        self.write_response(writer, 354, "End data with <CR><LF>.<CR><LF>")
            .await;

        let data = match read_data(reader, self.max_message_size).await {
            Ok(data) => data,
            Err(error) => {
                if let Some(transaction) = self.connection.end_transaction() {
                    warn!(transaction = %transaction.id, error = %error, "Data transfer interrupted, transaction discarded");
                }
                return Err(error.into());
            }
        };
        let Some(data) = data else {
            if let Some(transaction) = self.connection.end_transaction() {
                warn!(
                    transaction = %transaction.id,
                    limit = self.max_message_size,
                    "Message too large, transaction discarded"
                );
            }
            self.write_response(writer, 552, "Message exceeds fixed maximum message size")
                .await;
            return Ok(());
        };
        if let Some(transaction) = self.connection.transaction.as_mut() {
            transaction.attach_message(data);
        }
        self.hooks
            .dispatch(&mut self.connection, &HookEvent::BodyReceived)
            .await;

        let Some(mut transaction) = self.connection.end_transaction() else {
            return Ok(());
        };
        finalize(&mut transaction, &self.authserv_id);
        tx.send(transaction).await?;
        self.write_response(writer, 250, "Message accepted").await;

        Ok(())
    }

    async fn read_command<R: AsyncRead + AsyncBufRead + Unpin>(
        &mut self,
        reader: &mut R,
        line: &mut String,
    ) -> (String, Option<String>) {
        line.clear();

        reader.read_line(line).await.unwrap_or(0);

        let trimmed = line.trim();
        let (command, argument) = match trimmed.split_once(char::is_whitespace) {
            Some((command, argument)) => (command, Some(argument.trim().to_string())),
            None => (trimmed, None),
        };

        (command.to_uppercase(), argument)
    }

    async fn write_inner<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        message: &str,
        separator: &str,
    ) {
        debug!(connection = %self.connection.id, ">> {code}{separator}{message}");
        writer
            .write_all(format!("{code}{separator}{message}\r\n").as_bytes())
            .await
            .ok();
    }

    async fn write_response<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        message: &str,
    ) {
        self.write_inner(writer, code, message, " ").await;
    }

    async fn write_multiple<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        messages: &[&str],
    ) {
        for (index, message) in messages.iter().enumerate() {
            let is_last = index == messages.len() - 1;
            let separator = if is_last { " " } else { "-" };
            self.write_inner(writer, code, message, separator).await;
        }
    }
}

/// Extracts the address from a `FROM:<a@b>` / `TO:<a@b>` argument,
/// dropping any ESMTP parameters. The null path `<>` yields an empty
/// address.
fn parse_path(value: &str, prefix: &str) -> Option<String> {
    let head = value.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let path = value[prefix.len()..].trim_start();
    let inner = path.strip_prefix('<')?;
    let end = inner.find('>')?;
    Some(inner[..end].trim().to_string())
}

/// Reads the message up to the terminating `.` line, undoing dot
/// stuffing. Lines keep their original bytes and endings.
///
/// Returns `None` once the message grows past `limit`, the remainder is
/// still consumed up to the terminator. A stream ending before the
/// terminator is an [`UnexpectedEof`](std::io::ErrorKind::UnexpectedEof).
async fn read_data<R: AsyncRead + AsyncBufRead + Unpin>(
    reader: &mut R,
    limit: usize,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut data = Vec::new();
    let mut line = Vec::with_capacity(1024);
    let mut line_start = true;
    let mut oversized = false;
    loop {
        line.clear();
        let read = (&mut *reader)
            .take(DATA_CHUNK)
            .read_until(b'\n', &mut line)
            .await?;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before end of data",
            ));
        }

        let starts_line = line_start;
        line_start = line.ends_with(b"\n");
        if starts_line && (line == b".\r\n" || line == b".\n") {
            break;
        }
        if oversized {
            continue;
        }

        let content = if starts_line && line.starts_with(b".") {
            &line[1..]
        } else {
            &line[..]
        };
        if data.len() + content.len() > limit {
            oversized = true;
            data = Vec::new();
            continue;
        }
        data.extend_from_slice(content);
    }
    Ok((!oversized).then_some(data))
}

/// Renders the authentication trailer into the message and logs the
/// ledger, the transaction is then handed to delivery.
fn finalize(transaction: &mut Transaction, authserv_id: &str) {
    let trailer = transaction.auth_results.render(authserv_id);
    if let Some(message) = transaction.message_mut() {
        message.prepend_header("Authentication-Results", &trailer);
        message.rebuild();
    }
    for (owner, entry) in transaction.results.entries() {
        info!(transaction = %transaction.id, owner = %owner, entry = %entry, "Authentication result");
    }
}

/// Main function for the SMTP host.
///
/// Listens for incoming connections and runs every session through the
/// authentication hooks. Delivered transactions are consumed by a long
/// running task that logs them.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path =
        PathBuf::from(std::env::var("AUTHGATE_CONFIG").unwrap_or_else(|_| CONFIG_PATH.to_string()));
    let store = Arc::new(ConfigStore::new(load_config_or_default(&config_path)?));
    #[cfg(unix)]
    watch_reload(store.clone(), config_path.clone())?;

    let pipeline = AuthPipeline::new(Verifiers::system()?, store.clone());
    let mut hooks = HookTable::new();
    hooks.register(Arc::new(OriginAuth::new(pipeline)));
    let hooks = Arc::new(hooks);

    let listening = {
        let snapshot = store.snapshot();
        format!("{}:{}", snapshot.config.smtp.host, snapshot.config.smtp.port)
    };
    let listener = TcpListener::bind(&listening).await?;

    let (tx, mut rx) = mpsc::channel::<Transaction>(100);
    tokio::spawn(async move {
        while let Some(transaction) = rx.recv().await {
            info!(
                transaction = %transaction.id,
                sender = %transaction.sender(),
                recipients = transaction.recipients.len(),
                size = transaction.message().map_or(0, |message| message.raw().len()),
                "Message received"
            );
        }
    });

    info!(address = %listening, "Authgate-SMTP running");

    loop {
        let (stream, address) = listener.accept().await?;
        let hooks = hooks.clone();
        let store = store.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Err(error) = handle_smtp_session(stream, address.ip(), hooks, &store, tx).await
            {
                error!(error = %error, "Session failed");
            }
        });
    }
}

/// Reloads the configuration file whenever the process receives SIGHUP.
#[cfg(unix)]
fn watch_reload(store: Arc<ConfigStore>, path: PathBuf) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            reload(&store, &path);
        }
    });
    Ok(())
}

#[cfg(unix)]
fn reload(store: &ConfigStore, path: &Path) {
    if let Err(error) = store.reload(path) {
        warn!(path = %path.display(), error = %error, "Configuration reload failed, keeping current");
    }
}

async fn handle_smtp_session(
    stream: TcpStream,
    remote_ip: IpAddr,
    hooks: Arc<HookTable>,
    store: &ConfigStore,
    tx: mpsc::Sender<Transaction>,
) -> SessionResult {
    stream.set_nodelay(true)?;

    let mut session = SMTPSession::new(remote_ip, hooks, store);
    let (reader, writer) = split(stream);
    handle_stream(reader, writer, tx, &mut session).await
}

async fn handle_stream<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
    reader: R,
    mut writer: W,
    tx: mpsc::Sender<Transaction>,
    session: &mut SMTPSession,
) -> SessionResult {
    let mut line = String::with_capacity(4096);
    let mut reader = BufReader::new(reader);

    let banner = format!("{} Authgate SMTP", session.authserv_id);
    session.write_response(&mut writer, 220, &banner).await;

    loop {
        let (command, argument) = session.read_command(&mut reader, &mut line).await;
        if line.is_empty() {
            break;
        }

        debug!(connection = %session.connection.id, "<< {}", line.trim());

        let proceed = session
            .handle_command(&mut reader, &mut writer, &tx, &command, argument.as_deref())
            .await?;
        if !proceed {
            break;
        }
    }
    writer.shutdown().await.ok();
    Ok(())
}

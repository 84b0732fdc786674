//! Connection and transaction state handed to the hooks by the SMTP host.

use std::net::IpAddr;

use tracing::debug;
use uuid::Uuid;

use crate::{AuthResultsTrailer, EmailMessage, ResultsLedger, TransactionAuthContext};

/// State for one network connection.
#[derive(Debug)]
pub struct ConnectionState {
    pub id: Uuid,
    pub remote_ip: IpAddr,
    /// Host name of the receiving MTA.
    pub local_host: String,
    announced_hostname: Option<String>,
    pub transaction: Option<Transaction>,
}

impl ConnectionState {
    pub fn new(remote_ip: IpAddr, local_host: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_ip,
            local_host: local_host.to_string(),
            announced_hostname: None,
            transaction: None,
        }
    }

    /// Stores the HELO/EHLO hostname, replacing any earlier greeting
    /// (a client greets again after STARTTLS).
    pub fn on_greeting(&mut self, hostname: &str) {
        self.announced_hostname = Some(hostname.to_string());
    }

    pub fn announced_hostname(&self) -> Option<&str> {
        self.announced_hostname.as_deref()
    }

    /// Starts a new mail transaction, discarding any transaction in flight.
    pub fn begin_transaction(&mut self, sender: &str) -> &mut Transaction {
        let transaction = Transaction::new(sender);
        debug!(
            connection = %self.id,
            transaction = %transaction.id,
            sender = %sender,
            "Transaction started"
        );
        self.transaction.insert(transaction)
    }

    /// Ends the current transaction, handing it back to the caller.
    pub fn end_transaction(&mut self) -> Option<Transaction> {
        self.transaction.take()
    }
}

/// One mail transaction, from MAIL FROM until delivery or reset.
#[derive(Debug)]
pub struct Transaction {
    pub id: Uuid,
    sender: String,
    pub recipients: Vec<String>,
    /// Headers added before the message arrived, most recent first.
    leading_headers: Vec<(String, String)>,
    message: Option<EmailMessage>,
    pub auth: Option<TransactionAuthContext>,
    pub results: ResultsLedger,
    pub auth_results: AuthResultsTrailer,
}

impl Transaction {
    pub fn new(sender: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.to_string(),
            recipients: Vec::new(),
            leading_headers: Vec::new(),
            message: None,
            auth: None,
            results: ResultsLedger::new(),
            auth_results: AuthResultsTrailer::new(),
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Adds a header in front of all existing ones. Before the message is
    /// attached the header is kept aside and applied on attachment.
    pub fn add_leading_header(&mut self, name: &str, value: &str) {
        match self.message.as_mut() {
            Some(message) => message.prepend_header(name, value),
            None => self
                .leading_headers
                .insert(0, (name.to_string(), value.to_string())),
        }
    }

    /// Removes every header named `name`, returning how many were removed.
    pub fn remove_header(&mut self, name: &str) -> usize {
        let before = self.leading_headers.len();
        self.leading_headers
            .retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        let pending = before - self.leading_headers.len();
        pending
            + self
                .message
                .as_mut()
                .map_or(0, |message| message.remove_header(name))
    }

    /// Attaches the received message bytes, applying headers added so far.
    pub fn attach_message(&mut self, raw: impl Into<Vec<u8>>) {
        let mut message = EmailMessage::new(raw.into());
        for (name, value) in self.leading_headers.drain(..).rev() {
            message.prepend_header(&name, &value);
        }
        self.message = Some(message);
    }

    pub fn message(&self) -> Option<&EmailMessage> {
        self.message.as_ref()
    }

    pub fn message_mut(&mut self) -> Option<&mut EmailMessage> {
        self.message.as_mut()
    }

    /// Returns the pending leading headers (before a message is attached).
    pub fn leading_headers(&self) -> &[(String, String)] {
        &self.leading_headers
    }
}

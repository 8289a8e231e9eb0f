//! In-process mailbox server.
//!
//! Holds accounts, folders and messages in memory behind a mutex and hands
//! out `MemoryGateway` connections to them. Every mutating call is appended
//! to a per-account operation log, and failures can be scripted per
//! operation kind, so the pipeline can be exercised end to end without a
//! network server.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use tracing::debug;

use crate::config::AccountConfig;
use crate::error::GatewayError;
use crate::gateway::{AccountConnector, Credentials, GatewayFactory, MailboxGateway};
use crate::pipeline::types::{Flag, FolderHandle, Message, Uid};

/// Gateway call kinds, used for failure scripting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Connect,
    Authenticate,
    OpenFolder,
    Search,
    Fetch,
    Move,
    Append,
    SetFlags,
    ClearFlags,
    Expunge,
    CreateFolder,
}

/// A recorded mailbox mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Move { from: String, uid: Uid, to: String, new_uid: Uid },
    Append { folder: String, uid: Uid },
    SetFlags { folder: String, uid: Uid, flags: Vec<Flag> },
    ClearFlags { folder: String, uid: Uid, flags: Vec<Flag> },
    Expunge { folder: String, removed: Vec<Uid> },
    CreateFolder { path: String },
}

#[derive(Debug, Default)]
struct FolderState {
    messages: BTreeMap<Uid, Message>,
}

/// UIDs come from one counter per account, so a UID names at most one
/// message in the whole account, across folders and over time.
#[derive(Debug, Default)]
struct AccountState {
    /// Highest UID handed out so far.
    last_uid: u32,
    folders: BTreeMap<String, FolderState>,
    operations: Vec<Operation>,
    failures: VecDeque<(OpKind, GatewayError)>,
}

impl AccountState {
    fn folder(&self, path: &str) -> Result<&FolderState, GatewayError> {
        self.folders
            .get(path)
            .ok_or_else(|| GatewayError::FolderNotFound(path.to_string()))
    }

    fn folder_mut(&mut self, path: &str) -> Result<&mut FolderState, GatewayError> {
        self.folders
            .get_mut(path)
            .ok_or_else(|| GatewayError::FolderNotFound(path.to_string()))
    }

    fn message_mut(&mut self, folder: &str, uid: Uid) -> Result<&mut Message, GatewayError> {
        self.folder_mut(folder)?
            .messages
            .get_mut(&uid)
            .ok_or_else(|| GatewayError::MessageNotFound {
                folder: folder.to_string(),
                uid: uid.0,
            })
    }

    /// Store `message` in `folder` under a fresh UID, creating the folder
    /// if needed.
    fn insert(&mut self, folder: &str, mut message: Message) -> Uid {
        self.last_uid += 1;
        let uid = Uid(self.last_uid);
        message.uid = uid;
        self.folders
            .entry(folder.to_string())
            .or_default()
            .messages
            .insert(uid, message);
        uid
    }

    /// Pop the first scripted failure for `kind`, if any.
    fn take_failure(&mut self, kind: OpKind) -> Option<GatewayError> {
        let pos = self.failures.iter().position(|(k, _)| *k == kind)?;
        self.failures.remove(pos).map(|(_, err)| err)
    }
}

/// Shared in-memory mail server. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryServer {
    accounts: Arc<Mutex<HashMap<String, AccountState>>>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AccountState>> {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an account with an empty INBOX.
    pub fn add_account(&self, name: &str) {
        let mut accounts = self.lock();
        let state = accounts.entry(name.to_string()).or_default();
        state.folders.entry("INBOX".to_string()).or_default();
    }

    pub fn add_folder(&self, account: &str, path: &str) {
        let mut accounts = self.lock();
        let state = accounts.entry(account.to_string()).or_default();
        state.folders.entry(path.to_string()).or_default();
    }

    /// Place a message in a folder, assigning the account's next UID.
    pub fn deliver(&self, account: &str, folder: &str, message: Message) -> Uid {
        self.lock()
            .entry(account.to_string())
            .or_default()
            .insert(folder, message)
    }

    /// Place a message under a specific UID. Later deliveries continue
    /// after it.
    pub fn deliver_at(&self, account: &str, folder: &str, uid: Uid, mut message: Message) {
        let mut accounts = self.lock();
        let state = accounts.entry(account.to_string()).or_default();
        message.uid = uid;
        state.last_uid = state.last_uid.max(uid.0);
        state
            .folders
            .entry(folder.to_string())
            .or_default()
            .messages
            .insert(uid, message);
    }

    /// Parse and deliver raw RFC 822 bytes.
    pub fn deliver_raw(
        &self,
        account: &str,
        folder: &str,
        raw: &[u8],
        flags: BTreeSet<Flag>,
        received_at: Option<DateTime<Utc>>,
    ) -> Option<Uid> {
        let message = Message::from_rfc822(Uid(0), raw, flags, received_at)?;
        Some(self.deliver(account, folder, message))
    }

    pub fn message(&self, account: &str, folder: &str, uid: Uid) -> Option<Message> {
        self.lock()
            .get(account)?
            .folders
            .get(folder)?
            .messages
            .get(&uid)
            .cloned()
    }

    pub fn uids(&self, account: &str, folder: &str) -> Vec<Uid> {
        self.lock()
            .get(account)
            .and_then(|a| a.folders.get(folder))
            .map(|f| f.messages.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_folder(&self, account: &str, folder: &str) -> bool {
        self.lock()
            .get(account)
            .is_some_and(|a| a.folders.contains_key(folder))
    }

    /// Mutations recorded for an account, oldest first.
    pub fn operations(&self, account: &str) -> Vec<Operation> {
        self.lock()
            .get(account)
            .map(|a| a.operations.clone())
            .unwrap_or_default()
    }

    /// Make the next `kind` call on `account` fail with `error`.
    pub fn fail_next(&self, account: &str, kind: OpKind, error: GatewayError) {
        let mut accounts = self.lock();
        accounts
            .entry(account.to_string())
            .or_default()
            .failures
            .push_back((kind, error));
    }

    /// New, unconnected gateway for `account`.
    pub fn gateway(&self, account: &str) -> MemoryGateway {
        MemoryGateway {
            server: self.clone(),
            account: account.to_string(),
            connected: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
        }
    }

    /// Run `f` against the account state after checking scripted failures.
    fn with_account<T>(
        &self,
        account: &str,
        kind: OpKind,
        f: impl FnOnce(&mut AccountState) -> Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        let mut accounts = self.lock();
        let state = accounts
            .get_mut(account)
            .ok_or_else(|| GatewayError::UnknownAccount(account.to_string()))?;
        if let Some(err) = state.take_failure(kind) {
            debug!(account, ?kind, error = %err, "Scripted gateway failure");
            return Err(err);
        }
        f(state)
    }
}

impl GatewayFactory for MemoryServer {
    fn create(&self, account: &AccountConfig) -> Box<dyn MailboxGateway> {
        Box::new(self.gateway(&account.name))
    }
}

#[async_trait]
impl AccountConnector for MemoryServer {
    async fn open_account(&self, account: &str) -> Result<Box<dyn MailboxGateway>, GatewayError> {
        let gateway = self.gateway(account);
        gateway.connect("memory", 0, false).await?;
        let password = SecretString::from(String::new());
        gateway
            .authenticate(Credentials {
                username: account,
                password: &password,
            })
            .await?;
        Ok(Box::new(gateway))
    }
}

/// A connection to one account on a `MemoryServer`.
#[derive(Debug)]
pub struct MemoryGateway {
    server: MemoryServer,
    account: String,
    connected: AtomicBool,
    authenticated: AtomicBool,
}

impl MemoryGateway {
    fn ensure_ready(&self) -> Result<(), GatewayError> {
        if self.authenticated.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GatewayError::NotConnected)
        }
    }

    fn call<T>(
        &self,
        kind: OpKind,
        f: impl FnOnce(&mut AccountState) -> Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        self.ensure_ready()?;
        self.server.with_account(&self.account, kind, f)
    }
}

#[async_trait]
impl MailboxGateway for MemoryGateway {
    async fn connect(&self, host: &str, port: u16, _use_tls: bool) -> Result<(), GatewayError> {
        self.server
            .with_account(&self.account, OpKind::Connect, |_| Ok(()))?;
        self.connected.store(true, Ordering::SeqCst);
        debug!(account = %self.account, host, port, "Memory gateway connected");
        Ok(())
    }

    async fn authenticate(&self, credentials: Credentials<'_>) -> Result<(), GatewayError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(GatewayError::NotConnected);
        }
        self.server
            .with_account(&self.account, OpKind::Authenticate, |_| Ok(()))?;
        self.authenticated.store(true, Ordering::SeqCst);
        debug!(account = %self.account, user = credentials.username, "Memory gateway authenticated");
        Ok(())
    }

    async fn open_folder(
        &self,
        path: &str,
        read_write: bool,
    ) -> Result<FolderHandle, GatewayError> {
        self.call(OpKind::OpenFolder, |state| {
            state.folder(path)?;
            Ok(FolderHandle::new(path, read_write))
        })
    }

    async fn search_unprocessed(&self, folder: &FolderHandle) -> Result<Vec<Uid>, GatewayError> {
        self.call(OpKind::Search, |state| {
            Ok(state
                .folder(&folder.path)?
                .messages
                .values()
                .filter(|m| !m.flags.contains(&Flag::Deleted))
                .map(|m| m.uid)
                .collect())
        })
    }

    async fn fetch_message(
        &self,
        folder: &FolderHandle,
        uid: Uid,
    ) -> Result<Message, GatewayError> {
        self.call(OpKind::Fetch, |state| {
            state.message_mut(&folder.path, uid).map(|m| m.clone())
        })
    }

    async fn move_message(
        &self,
        folder: &str,
        uid: Uid,
        dest_folder: &str,
    ) -> Result<Option<Uid>, GatewayError> {
        self.call(OpKind::Move, |state| {
            state.folder(dest_folder)?;
            let message = state
                .folder_mut(folder)?
                .messages
                .remove(&uid)
                .ok_or_else(|| GatewayError::MessageNotFound {
                    folder: folder.to_string(),
                    uid: uid.0,
                })?;
            let new_uid = state.insert(dest_folder, message);
            state.operations.push(Operation::Move {
                from: folder.to_string(),
                uid,
                to: dest_folder.to_string(),
                new_uid,
            });
            Ok(Some(new_uid))
        })
    }

    async fn append(&self, folder: &str, message: &Message) -> Result<Uid, GatewayError> {
        self.call(OpKind::Append, |state| {
            state.folder(folder)?;
            let uid = state.insert(folder, message.clone());
            state.operations.push(Operation::Append {
                folder: folder.to_string(),
                uid,
            });
            Ok(uid)
        })
    }

    async fn set_flags(
        &self,
        folder: &str,
        uid: Uid,
        flags: &[Flag],
    ) -> Result<(), GatewayError> {
        self.call(OpKind::SetFlags, |state| {
            state.message_mut(folder, uid)?.flags.extend(flags.iter().copied());
            state.operations.push(Operation::SetFlags {
                folder: folder.to_string(),
                uid,
                flags: flags.to_vec(),
            });
            Ok(())
        })
    }

    async fn clear_flags(
        &self,
        folder: &str,
        uid: Uid,
        flags: &[Flag],
    ) -> Result<(), GatewayError> {
        self.call(OpKind::ClearFlags, |state| {
            let message = state.message_mut(folder, uid)?;
            for flag in flags {
                message.flags.remove(flag);
            }
            state.operations.push(Operation::ClearFlags {
                folder: folder.to_string(),
                uid,
                flags: flags.to_vec(),
            });
            Ok(())
        })
    }

    async fn expunge(&self, folder: &str) -> Result<(), GatewayError> {
        self.call(OpKind::Expunge, |state| {
            let messages = &mut state.folder_mut(folder)?.messages;
            let removed: Vec<Uid> = messages
                .values()
                .filter(|m| m.flags.contains(&Flag::Deleted))
                .map(|m| m.uid)
                .collect();
            for uid in &removed {
                messages.remove(uid);
            }
            state.operations.push(Operation::Expunge {
                folder: folder.to_string(),
                removed,
            });
            Ok(())
        })
    }

    async fn folder_exists(&self, path: &str) -> Result<bool, GatewayError> {
        self.ensure_ready()?;
        Ok(self.server.has_folder(&self.account, path))
    }

    async fn create_folder(&self, path: &str) -> Result<(), GatewayError> {
        self.call(OpKind::CreateFolder, |state| {
            state.folders.entry(path.to_string()).or_default();
            state.operations.push(Operation::CreateFolder {
                path: path.to_string(),
            });
            Ok(())
        })
    }

    async fn disconnect(&self) -> Result<(), GatewayError> {
        self.authenticated.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        debug!(account = %self.account, "Memory gateway disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &[u8] = b"From: alice@example.com\r\nTo: bob@example.com\r\nSubject: Hello\r\n\r\nHi Bob\r\n";

    async fn connected(server: &MemoryServer, account: &str) -> MemoryGateway {
        let gw = server.gateway(account);
        let password = SecretString::from("pw".to_string());
        gw.connect("localhost", 993, true).await.unwrap();
        gw.authenticate(Credentials {
            username: account,
            password: &password,
        })
        .await
        .unwrap();
        gw
    }

    #[tokio::test]
    async fn operations_require_authentication() {
        let server = MemoryServer::new();
        server.add_account("work");
        let gw = server.gateway("work");
        assert!(matches!(
            gw.open_folder("INBOX", true).await,
            Err(GatewayError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn deliver_and_fetch() {
        let server = MemoryServer::new();
        server.add_account("work");
        let uid = server
            .deliver_raw("work", "INBOX", RAW, BTreeSet::new(), None)
            .unwrap();
        assert_eq!(uid, Uid(1));

        let gw = connected(&server, "work").await;
        let inbox = gw.open_folder("INBOX", true).await.unwrap();
        assert_eq!(gw.search_unprocessed(&inbox).await.unwrap(), vec![Uid(1)]);
        let msg = gw.fetch_message(&inbox, uid).await.unwrap();
        assert_eq!(msg.subject, "Hello");
        assert_eq!(msg.uid, uid);
    }

    #[tokio::test]
    async fn move_assigns_new_uid_and_logs() {
        let server = MemoryServer::new();
        server.add_account("work");
        server.add_folder("work", "Archive");
        let uid = server
            .deliver_raw("work", "INBOX", RAW, BTreeSet::new(), None)
            .unwrap();

        let gw = connected(&server, "work").await;
        let new_uid = gw.move_message("INBOX", uid, "Archive").await.unwrap();
        assert_eq!(new_uid, Some(Uid(2)));
        assert!(server.uids("work", "INBOX").is_empty());
        assert_eq!(server.uids("work", "Archive"), vec![Uid(2)]);
        assert_eq!(server.operations("work").len(), 1);
    }

    #[tokio::test]
    async fn move_to_missing_folder_fails() {
        let server = MemoryServer::new();
        server.add_account("work");
        let uid = server
            .deliver_raw("work", "INBOX", RAW, BTreeSet::new(), None)
            .unwrap();
        let gw = connected(&server, "work").await;
        assert!(matches!(
            gw.move_message("INBOX", uid, "Nowhere").await,
            Err(GatewayError::FolderNotFound(_))
        ));
        assert_eq!(server.uids("work", "INBOX"), vec![uid]);
    }

    #[tokio::test]
    async fn expunge_removes_deleted_only() {
        let server = MemoryServer::new();
        server.add_account("work");
        let a = server
            .deliver_raw("work", "INBOX", RAW, BTreeSet::new(), None)
            .unwrap();
        let b = server
            .deliver_raw("work", "INBOX", RAW, BTreeSet::new(), None)
            .unwrap();
        let gw = connected(&server, "work").await;
        gw.set_flags("INBOX", a, &[Flag::Deleted]).await.unwrap();
        gw.expunge("INBOX").await.unwrap();
        assert_eq!(server.uids("work", "INBOX"), vec![b]);
    }

    #[tokio::test]
    async fn uids_are_unique_across_folders() {
        let server = MemoryServer::new();
        server.add_account("work");
        server.add_folder("work", "Lists");
        let inbox = server
            .deliver_raw("work", "INBOX", RAW, BTreeSet::new(), None)
            .unwrap();
        let lists = server
            .deliver_raw("work", "Lists", RAW, BTreeSet::new(), None)
            .unwrap();
        assert_ne!(inbox, lists);

        let gw = connected(&server, "work").await;
        let copy = server.message("work", "INBOX", inbox).unwrap();
        let appended = gw.append("Lists", &copy).await.unwrap();
        assert_eq!(appended, Uid(3));

        // Accounts keep separate counters.
        server.add_account("home");
        let home = server
            .deliver_raw("home", "INBOX", RAW, BTreeSet::new(), None)
            .unwrap();
        assert_eq!(home, Uid(1));
    }

    #[tokio::test]
    async fn scripted_failure_fires_once() {
        let server = MemoryServer::new();
        server.add_account("work");
        server.fail_next("work", OpKind::Connect, GatewayError::Connection("refused".into()));

        let gw = server.gateway("work");
        assert!(gw.connect("localhost", 993, true).await.is_err());
        assert!(gw.connect("localhost", 993, true).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_account_rejected_on_connect() {
        let server = MemoryServer::new();
        let gw = server.gateway("ghost");
        assert!(matches!(
            gw.connect("localhost", 993, true).await,
            Err(GatewayError::UnknownAccount(_))
        ));
    }
}

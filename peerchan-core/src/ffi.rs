//! C ABI for linking peerchan-core as a static library from C/C++ hosts.
//! A native engine plugs in through `PeerchanEngineVtable`; the host drives
//! sessions through the `peerchan_session_*` exports.

use std::ffi::{c_void, CStr, CString};
use std::os::raw::{c_char, c_int};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::engine::{
    DataFrame, EngineConfig, EngineHooks, EngineOpener, EngineStatus, IceServer,
    IceTransportPolicy, PeerEngine,
};
use crate::error::SessionError;
use crate::event::{DataKind, SignalKind};
use crate::scheduler::{HostScheduler, Task};
use crate::session::PeerSession;
use crate::state::{ConnectionState, Role};

pub const PEERCHAN_OK: c_int = 0;
/// Null pointer, bad UTF-8 or out-of-range enum value.
pub const PEERCHAN_ERR_INVALID_ARG: c_int = -1;

pub const PEERCHAN_ROLE_CONTROLLING: c_int = 0;
pub const PEERCHAN_ROLE_CONTROLLED: c_int = 1;

pub const PEERCHAN_MSG_SDP: c_int = 0;
pub const PEERCHAN_MSG_CANDIDATE: c_int = 1;

pub const PEERCHAN_DATA_BINARY: c_int = 0;
pub const PEERCHAN_DATA_TEXT: c_int = 1;

pub const PEERCHAN_EVENT_OFFER: c_int = 0;
pub const PEERCHAN_EVENT_ANSWER: c_int = 1;
pub const PEERCHAN_EVENT_ICE: c_int = 2;
pub const PEERCHAN_EVENT_DATA: c_int = 3;
pub const PEERCHAN_EVENT_STATE: c_int = 4;
pub const PEERCHAN_EVENT_ERROR: c_int = 5;

/// Callbacks handed to the native engine at open. The engine copies the struct and
/// passes `ctx` back on every call until its `close` returns.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PeerchanEngineCallbacks {
    pub ctx: *mut c_void,
    pub on_message: extern "C" fn(ctx: *mut c_void, kind: c_int, data: *const u8, len: usize),
    pub on_state: extern "C" fn(ctx: *mut c_void, state: c_int),
    pub on_data: extern "C" fn(
        ctx: *mut c_void,
        kind: c_int,
        stream_id: u16,
        data: *const u8,
        len: usize,
    ),
    /// `message` is NUL-terminated; may be null.
    pub on_error: extern "C" fn(ctx: *mut c_void, message: *const c_char),
}

#[repr(C)]
pub struct PeerchanIceServer {
    pub url: *const c_char,
    /// Nullable.
    pub username: *const c_char,
    /// Nullable.
    pub credential: *const c_char,
}

#[repr(C)]
pub struct PeerchanEngineConfig {
    pub ice_servers: *const PeerchanIceServer,
    pub ice_server_count: usize,
    pub relay_only: bool,
    pub agent_recv_timeout_ms: u32,
    pub send_cache_size: usize,
    pub recv_cache_size: usize,
    pub enable_data_channel: bool,
}

/// Native engine entry points. Every field except `pre_generate_cert` is required.
/// All functions return 0 on success.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PeerchanEngineVtable {
    pub open: Option<
        unsafe extern "C" fn(
            role: c_int,
            config: *const PeerchanEngineConfig,
            callbacks: *const PeerchanEngineCallbacks,
            out_engine: *mut *mut c_void,
        ) -> c_int,
    >,
    pub new_connection: Option<unsafe extern "C" fn(engine: *mut c_void) -> c_int>,
    pub send_msg: Option<
        unsafe extern "C" fn(engine: *mut c_void, kind: c_int, data: *const u8, len: usize) -> c_int,
    >,
    pub send_data: Option<
        unsafe extern "C" fn(
            engine: *mut c_void,
            kind: c_int,
            stream_id: u16,
            data: *const u8,
            len: usize,
        ) -> c_int,
    >,
    pub disconnect: Option<unsafe extern "C" fn(engine: *mut c_void) -> c_int>,
    /// Blocks until the engine released everything. No callbacks after it returns.
    pub close: Option<unsafe extern "C" fn(engine: *mut c_void) -> c_int>,
    pub main_loop: Option<unsafe extern "C" fn(engine: *mut c_void) -> c_int>,
    pub pre_generate_cert: Option<unsafe extern "C" fn() -> c_int>,
}

type OpenFn = unsafe extern "C" fn(
    c_int,
    *const PeerchanEngineConfig,
    *const PeerchanEngineCallbacks,
    *mut *mut c_void,
) -> c_int;
type HandleFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type SendMsgFn = unsafe extern "C" fn(*mut c_void, c_int, *const u8, usize) -> c_int;
type SendDataFn = unsafe extern "C" fn(*mut c_void, c_int, u16, *const u8, usize) -> c_int;

/// Vtable with every required entry present.
#[derive(Clone, Copy)]
struct NativeFns {
    open: OpenFn,
    new_connection: HandleFn,
    send_msg: SendMsgFn,
    send_data: SendDataFn,
    disconnect: HandleFn,
    close: HandleFn,
    main_loop: HandleFn,
    pre_generate_cert: Option<unsafe extern "C" fn() -> c_int>,
}

/// `EngineOpener` backed by a native vtable.
pub struct NativeOpener {
    fns: NativeFns,
}

impl NativeOpener {
    /// None if a required entry is missing.
    pub fn new(vtable: &PeerchanEngineVtable) -> Option<Self> {
        Some(Self {
            fns: NativeFns {
                open: vtable.open?,
                new_connection: vtable.new_connection?,
                send_msg: vtable.send_msg?,
                send_data: vtable.send_data?,
                disconnect: vtable.disconnect?,
                close: vtable.close?,
                main_loop: vtable.main_loop?,
                pre_generate_cert: vtable.pre_generate_cert,
            },
        })
    }
}

impl EngineOpener for NativeOpener {
    fn open(
        &self,
        role: Role,
        config: &EngineConfig,
        hooks: Arc<dyn EngineHooks>,
    ) -> Result<Arc<dyn PeerEngine>, EngineStatus> {
        let strings = IceStrings::new(&config.ice_servers)
            .ok_or(EngineStatus(PEERCHAN_ERR_INVALID_ARG))?;
        let servers = strings.raw();
        let c_config = PeerchanEngineConfig {
            ice_servers: if servers.is_empty() {
                ptr::null()
            } else {
                servers.as_ptr()
            },
            ice_server_count: servers.len(),
            relay_only: config.ice_transport_policy == IceTransportPolicy::Relay,
            agent_recv_timeout_ms: config.agent_recv_timeout_ms,
            send_cache_size: config.send_cache_size,
            recv_cache_size: config.recv_cache_size,
            enable_data_channel: config.enable_data_channel,
        };
        let ctx = Box::into_raw(Box::new(hooks));
        let callbacks = PeerchanEngineCallbacks {
            ctx: ctx as *mut c_void,
            on_message: hook_message,
            on_state: hook_state,
            on_data: hook_data,
            on_error: hook_error,
        };
        let mut handle: *mut c_void = ptr::null_mut();
        let status = unsafe { (self.fns.open)(role_code(role), &c_config, &callbacks, &mut handle) };
        if status != 0 || handle.is_null() {
            drop(unsafe { Box::from_raw(ctx) });
            return Err(EngineStatus(if status != 0 { status } else { PEERCHAN_ERR_INVALID_ARG }));
        }
        let engine = NativeEngine {
            fns: self.fns,
            handle,
            hooks: ctx,
            closed: AtomicBool::new(false),
        };
        Ok(Arc::new(engine) as Arc<dyn PeerEngine>)
    }

    fn pre_generate_cert(&self) -> Result<(), EngineStatus> {
        match self.fns.pre_generate_cert {
            Some(f) => EngineStatus(unsafe { f() }).into_result(),
            None => Ok(()),
        }
    }
}

/// Owned C strings for ICE servers, alive for the duration of `open`.
struct IceStrings(Vec<(CString, Option<CString>, Option<CString>)>);

impl IceStrings {
    fn new(servers: &[IceServer]) -> Option<Self> {
        let opt = |s: &Option<String>| -> Option<Option<CString>> {
            match s {
                Some(s) => CString::new(s.as_str()).ok().map(Some),
                None => Some(None),
            }
        };
        servers
            .iter()
            .map(|s| Some((CString::new(s.url.as_str()).ok()?, opt(&s.username)?, opt(&s.credential)?)))
            .collect::<Option<Vec<_>>>()
            .map(IceStrings)
    }

    fn raw(&self) -> Vec<PeerchanIceServer> {
        let p = |s: &Option<CString>| s.as_ref().map_or(ptr::null(), |s| s.as_ptr());
        self.0
            .iter()
            .map(|(url, user, cred)| PeerchanIceServer {
                url: url.as_ptr(),
                username: p(user),
                credential: p(cred),
            })
            .collect()
    }
}

struct NativeEngine {
    fns: NativeFns,
    handle: *mut c_void,
    hooks: *mut Arc<dyn EngineHooks>,
    closed: AtomicBool,
}

// The native engine accepts calls from any thread.
unsafe impl Send for NativeEngine {}
unsafe impl Sync for NativeEngine {}

impl PeerEngine for NativeEngine {
    fn new_connection(&self) -> Result<(), EngineStatus> {
        EngineStatus(unsafe { (self.fns.new_connection)(self.handle) }).into_result()
    }

    fn send_signal(&self, kind: SignalKind, payload: &[u8]) -> Result<(), EngineStatus> {
        let kind = match kind {
            SignalKind::Sdp => PEERCHAN_MSG_SDP,
            SignalKind::IceCandidate => PEERCHAN_MSG_CANDIDATE,
        };
        EngineStatus(unsafe { (self.fns.send_msg)(self.handle, kind, payload.as_ptr(), payload.len()) })
            .into_result()
    }

    fn send_data(&self, frame: DataFrame<'_>) -> Result<(), EngineStatus> {
        let status = unsafe {
            (self.fns.send_data)(
                self.handle,
                data_kind_code(frame.kind),
                frame.stream_id,
                frame.data.as_ptr(),
                frame.data.len(),
            )
        };
        EngineStatus(status).into_result()
    }

    fn disconnect(&self) -> Result<(), EngineStatus> {
        EngineStatus(unsafe { (self.fns.disconnect)(self.handle) }).into_result()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let status = unsafe { (self.fns.close)(self.handle) };
        if status != 0 {
            warn!(status, "native engine close failed");
        }
    }

    fn iterate_once(&self) {
        unsafe { (self.fns.main_loop)(self.handle) };
    }
}

impl Drop for NativeEngine {
    fn drop(&mut self) {
        self.close();
        // No callbacks can arrive once close returned.
        drop(unsafe { Box::from_raw(self.hooks) });
    }
}

fn role_code(role: Role) -> c_int {
    match role {
        Role::Controlling => PEERCHAN_ROLE_CONTROLLING,
        Role::Controlled => PEERCHAN_ROLE_CONTROLLED,
    }
}

fn data_kind_code(kind: DataKind) -> c_int {
    match kind {
        DataKind::Binary => PEERCHAN_DATA_BINARY,
        DataKind::Text => PEERCHAN_DATA_TEXT,
    }
}

unsafe fn bytes<'a>(data: *const u8, len: usize) -> &'a [u8] {
    if data.is_null() || len == 0 {
        &[]
    } else {
        slice::from_raw_parts(data, len)
    }
}

fn with_hooks(ctx: *mut c_void, f: impl FnOnce(&dyn EngineHooks)) {
    if ctx.is_null() {
        return;
    }
    let hooks = unsafe { &*(ctx as *const Arc<dyn EngineHooks>) };
    if panic::catch_unwind(AssertUnwindSafe(|| f(hooks.as_ref()))).is_err() {
        error!("panic in engine callback");
    }
}

extern "C" fn hook_message(ctx: *mut c_void, kind: c_int, data: *const u8, len: usize) {
    let kind = match kind {
        PEERCHAN_MSG_SDP => SignalKind::Sdp,
        PEERCHAN_MSG_CANDIDATE => SignalKind::IceCandidate,
        other => {
            warn!(kind = other, "unknown engine message type");
            return;
        }
    };
    let payload = unsafe { bytes(data, len) };
    with_hooks(ctx, |hooks| hooks.on_message(kind, payload));
}

extern "C" fn hook_state(ctx: *mut c_void, state: c_int) {
    match ConnectionState::from_code(state) {
        Some(state) => with_hooks(ctx, |hooks| hooks.on_state(state)),
        None => warn!(state, "unknown engine state"),
    }
}

extern "C" fn hook_data(ctx: *mut c_void, kind: c_int, stream_id: u16, data: *const u8, len: usize) {
    let kind = if kind == PEERCHAN_DATA_TEXT {
        DataKind::Text
    } else {
        DataKind::Binary
    };
    let data = unsafe { bytes(data, len) };
    with_hooks(ctx, |hooks| {
        hooks.on_data(DataFrame {
            kind,
            stream_id,
            data,
        })
    });
}

extern "C" fn hook_error(ctx: *mut c_void, message: *const c_char) {
    let message = if message.is_null() {
        String::from("unknown engine error")
    } else {
        unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned()
    };
    with_hooks(ctx, |hooks| hooks.on_error(&message));
}

/// Opaque user pointer carried across threads; the host guarantees it stays valid.
#[derive(Clone, Copy)]
struct UserData(*mut c_void);

unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

/// A dispatcher run scheduled on the host. Run it with `peerchan_task_run` on the
/// host thread, or free it unrun with `peerchan_task_drop`.
pub struct PeerchanTask(Task);

pub type PeerchanScheduleFn = unsafe extern "C" fn(user: *mut c_void, task: *mut PeerchanTask);

struct CScheduler {
    schedule: PeerchanScheduleFn,
    user: UserData,
}

impl HostScheduler for CScheduler {
    fn schedule(&self, task: Task) {
        let task = Box::into_raw(Box::new(PeerchanTask(task)));
        unsafe { (self.schedule)(self.user.0, task) };
    }
}

/// Event callback. `code` is the state code for `PEERCHAN_EVENT_STATE`, else 0.
/// `data` is not NUL-terminated and is only valid during the call.
pub type PeerchanEventFn =
    unsafe extern "C" fn(user: *mut c_void, event: c_int, code: c_int, data: *const u8, len: usize);

#[derive(Clone, Copy)]
struct EventSink {
    cb: PeerchanEventFn,
    user: UserData,
}

impl EventSink {
    fn emit(&self, event: c_int, code: c_int, data: &[u8]) {
        unsafe { (self.cb)(self.user.0, event, code, data.as_ptr(), data.len()) };
    }
}

unsafe fn engine_config_from_c(config: *const PeerchanEngineConfig) -> Option<EngineConfig> {
    let Some(config) = config.as_ref() else {
        return Some(EngineConfig::default());
    };
    let text = |p: *const c_char| -> Option<Option<String>> {
        if p.is_null() {
            return Some(None);
        }
        CStr::from_ptr(p).to_str().ok().map(|s| Some(s.to_string()))
    };
    let mut ice_servers = Vec::with_capacity(config.ice_server_count);
    if config.ice_server_count > 0 {
        if config.ice_servers.is_null() {
            return None;
        }
        for server in slice::from_raw_parts(config.ice_servers, config.ice_server_count) {
            ice_servers.push(IceServer {
                url: text(server.url)??,
                username: text(server.username)?,
                credential: text(server.credential)?,
            });
        }
    }
    Some(EngineConfig {
        ice_servers,
        ice_transport_policy: if config.relay_only {
            IceTransportPolicy::Relay
        } else {
            IceTransportPolicy::All
        },
        agent_recv_timeout_ms: config.agent_recv_timeout_ms,
        send_cache_size: config.send_cache_size,
        recv_cache_size: config.recv_cache_size,
        enable_data_channel: config.enable_data_channel,
    })
}

unsafe fn session<'a>(h: *mut c_void) -> Option<&'a PeerSession> {
    (h as *const PeerSession).as_ref()
}

fn status(result: Result<(), SessionError>) -> c_int {
    match result {
        Ok(()) => PEERCHAN_OK,
        Err(e) => e.code(),
    }
}

/// Library version as a static NUL-terminated string.
#[no_mangle]
pub extern "C" fn peerchan_version() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const c_char
}

/// Generate engine certificate material ahead of the first session. Returns 0 on success.
#[no_mangle]
pub extern "C" fn peerchan_pre_generate_cert(vtable: *const PeerchanEngineVtable) -> c_int {
    if vtable.is_null() {
        return PEERCHAN_ERR_INVALID_ARG;
    }
    let Some(opener) = NativeOpener::new(unsafe { &*vtable }) else {
        return PEERCHAN_ERR_INVALID_ARG;
    };
    match crate::pre_generate_cert(&opener) {
        Ok(()) => PEERCHAN_OK,
        Err(status) => status.0,
    }
}

/// Create a session. `config` may be null for defaults. `schedule` may be null, in
/// which case the host drains events itself with `peerchan_session_process_queue`.
/// Returns an opaque handle or null on failure.
#[no_mangle]
pub extern "C" fn peerchan_session_create(
    vtable: *const PeerchanEngineVtable,
    role: c_int,
    config: *const PeerchanEngineConfig,
    schedule: Option<PeerchanScheduleFn>,
    schedule_user: *mut c_void,
) -> *mut c_void {
    if vtable.is_null() {
        warn!("session create: null engine vtable");
        return ptr::null_mut();
    }
    let Some(opener) = NativeOpener::new(unsafe { &*vtable }) else {
        warn!("session create: incomplete engine vtable");
        return ptr::null_mut();
    };
    let role = match role {
        PEERCHAN_ROLE_CONTROLLING => Role::Controlling,
        PEERCHAN_ROLE_CONTROLLED => Role::Controlled,
        other => {
            warn!(role = other, "session create: unknown role");
            return ptr::null_mut();
        }
    };
    let Some(engine_config) = (unsafe { engine_config_from_c(config) }) else {
        warn!("session create: invalid engine config");
        return ptr::null_mut();
    };
    let mut builder = PeerSession::builder(role).engine_config(engine_config);
    if let Some(schedule) = schedule {
        builder = builder.scheduler(Arc::new(CScheduler {
            schedule,
            user: UserData(schedule_user),
        }));
    }
    match builder.open(&opener) {
        Ok(session) => Box::into_raw(Box::new(session)) as *mut c_void,
        Err(e) => {
            debug!(error = %e, "session create failed");
            ptr::null_mut()
        }
    }
}

/// Destroy a session. Starts a background close if still open. No-op if h is null.
#[no_mangle]
pub extern "C" fn peerchan_session_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut PeerSession) };
}

/// Route every session event to `cb`. Null `cb` discards events.
#[no_mangle]
pub extern "C" fn peerchan_session_set_event_callback(
    h: *mut c_void,
    cb: Option<PeerchanEventFn>,
    user: *mut c_void,
) -> c_int {
    let Some(s) = (unsafe { session(h) }) else {
        return SessionError::NotInitialized.code();
    };
    let sink = cb.map(|cb| EventSink {
        cb,
        user: UserData(user),
    });
    s.on_offer(move |sdp| {
        if let Some(sink) = sink {
            sink.emit(PEERCHAN_EVENT_OFFER, 0, sdp.as_bytes());
        }
    });
    s.on_answer(move |sdp| {
        if let Some(sink) = sink {
            sink.emit(PEERCHAN_EVENT_ANSWER, 0, sdp.as_bytes());
        }
    });
    s.on_ice(move |candidate| {
        if let Some(sink) = sink {
            sink.emit(PEERCHAN_EVENT_ICE, 0, candidate.as_bytes());
        }
    });
    s.on_data(move |data| {
        if let Some(sink) = sink {
            sink.emit(PEERCHAN_EVENT_DATA, 0, &data);
        }
    });
    s.on_state(move |state| {
        if let Some(sink) = sink {
            sink.emit(PEERCHAN_EVENT_STATE, state.code(), &[]);
        }
    });
    s.on_error(move |message| {
        if let Some(sink) = sink {
            sink.emit(PEERCHAN_EVENT_ERROR, 0, message.as_bytes());
        }
    });
    PEERCHAN_OK
}

#[no_mangle]
pub extern "C" fn peerchan_session_start_connection(h: *mut c_void) -> c_int {
    match unsafe { session(h) } {
        Some(s) => status(s.start_connection()),
        None => SessionError::NotInitialized.code(),
    }
}

/// `sdp` is NUL-terminated UTF-8.
#[no_mangle]
pub extern "C" fn peerchan_session_set_remote_description(h: *mut c_void, sdp: *const c_char) -> c_int {
    let Some(s) = (unsafe { session(h) }) else {
        return SessionError::NotInitialized.code();
    };
    if sdp.is_null() {
        return PEERCHAN_ERR_INVALID_ARG;
    }
    match unsafe { CStr::from_ptr(sdp) }.to_str() {
        Ok(sdp) => status(s.set_remote_description(sdp)),
        Err(_) => PEERCHAN_ERR_INVALID_ARG,
    }
}

/// `candidate` is NUL-terminated UTF-8.
#[no_mangle]
pub extern "C" fn peerchan_session_add_ice_candidate(h: *mut c_void, candidate: *const c_char) -> c_int {
    let Some(s) = (unsafe { session(h) }) else {
        return SessionError::NotInitialized.code();
    };
    if candidate.is_null() {
        return PEERCHAN_ERR_INVALID_ARG;
    }
    match unsafe { CStr::from_ptr(candidate) }.to_str() {
        Ok(candidate) => status(s.add_ice_candidate(candidate)),
        Err(_) => PEERCHAN_ERR_INVALID_ARG,
    }
}

#[no_mangle]
pub extern "C" fn peerchan_session_send(h: *mut c_void, data: *const u8, len: usize) -> c_int {
    let Some(s) = (unsafe { session(h) }) else {
        return SessionError::NotInitialized.code();
    };
    if data.is_null() && len > 0 {
        return PEERCHAN_ERR_INVALID_ARG;
    }
    status(s.send(unsafe { bytes(data, len) }))
}

/// Send without the open-channel check. Empty payloads are ignored.
#[no_mangle]
pub extern "C" fn peerchan_session_send_raw(h: *mut c_void, data: *const u8, len: usize) -> c_int {
    let Some(s) = (unsafe { session(h) }) else {
        return SessionError::NotInitialized.code();
    };
    status(s.send_raw(unsafe { bytes(data, len) }))
}

/// 1 if connected, 0 otherwise (including a null handle).
#[no_mangle]
pub extern "C" fn peerchan_session_is_connected(h: *mut c_void) -> c_int {
    unsafe { session(h) }.map_or(0, |s| s.is_connected() as c_int)
}

#[no_mangle]
pub extern "C" fn peerchan_session_is_data_channel_open(h: *mut c_void) -> c_int {
    unsafe { session(h) }.map_or(0, |s| s.is_data_channel_open() as c_int)
}

#[no_mangle]
pub extern "C" fn peerchan_session_disconnect(h: *mut c_void) {
    if let Some(s) = unsafe { session(h) } {
        s.disconnect();
    }
}

/// Non-blocking close; the native close runs on a worker.
#[no_mangle]
pub extern "C" fn peerchan_session_close(h: *mut c_void) {
    if let Some(s) = unsafe { session(h) } {
        s.close();
    }
}

/// Blocking close; returns once the native engine released everything.
#[no_mangle]
pub extern "C" fn peerchan_session_close_sync(h: *mut c_void) {
    if let Some(s) = unsafe { session(h) } {
        s.close_sync();
    }
}

/// Deliver queued events to the event callback. Returns how many were delivered.
#[no_mangle]
pub extern "C" fn peerchan_session_process_queue(h: *mut c_void) -> c_int {
    unsafe { session(h) }.map_or(0, |s| c_int::try_from(s.process_queue()).unwrap_or(c_int::MAX))
}

/// Run a scheduled task on the calling (host) thread and free it.
#[no_mangle]
pub extern "C" fn peerchan_task_run(task: *mut PeerchanTask) {
    if task.is_null() {
        return;
    }
    let PeerchanTask(task) = *unsafe { Box::from_raw(task) };
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!("panic in scheduled task");
    }
}

/// Free a scheduled task without running it. The session schedules a fresh
/// dispatcher run on its next event.
#[no_mangle]
pub extern "C" fn peerchan_task_drop(task: *mut PeerchanTask) {
    if task.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(task) };
}

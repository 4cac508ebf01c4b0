//! The windower protocol: messages the userspace compositor exchanges
//! with its clients over an IPC socket.
//!
//! The kernel never interprets these; they are defined here so both
//! sides of the socket agree on the layout. A client connects to the
//! compositor's IPC service, receives `Connected` carrying a pipe
//! handle for the event stream, and then issues requests.

use crate::Handle;
use crate::input::{MouseEvent, Scancode};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    CreateWindow,
    CloseWindow,
    Redraw,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Request {
    pub ty: RequestType,
    pub body: RequestBody,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union RequestBody {
    pub create_window: CreateWindow,
    pub close_window: WindowRef,
    pub redraw: WindowRef,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CreateWindow {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A compositor-assigned opaque window identity.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRef {
    pub window: usize,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Ack,
    Connected,
    WindowCreated,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Response {
    pub ty: ResponseType,
    pub body: ResponseBody,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union ResponseBody {
    pub ack: WindowRef,
    pub connected: Connected,
    pub window_created: WindowCreated,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Connected {
    /// Read end of the pipe carrying `WindowEvent`s.
    pub event_handle: Handle,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct WindowCreated {
    pub window: WindowRef,
    /// Shared-memory handle of the window's pixel buffer.
    pub fb_handle: Handle,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEventType {
    CloseRequested,
    Mouse,
    MouseEnter,
    MouseLeave,
    Key,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct WindowEvent {
    pub ty: WindowEventType,
    pub window: WindowRef,
    pub body: WindowEventBody,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union WindowEventBody {
    pub mouse: MouseEvent,
    pub key: WindowKeyEvent,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WindowKeyEvent {
    pub code: Scancode,
    pub prev_pressed: bool,
    pub pressed: bool,
}

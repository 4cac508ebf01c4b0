//! Input events delivered by `PollEvent`.

/// Physical key identity, independent of layout.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scancode {
    Unknown = 0,
    Escape,
    Num1,
    Num2,
    Num3,
    Num4,
    Num5,
    Num6,
    Num7,
    Num8,
    Num9,
    Num0,
    Minus,
    Equals,
    Backspace,
    Tab,
    Q,
    W,
    E,
    R,
    T,
    Y,
    U,
    I,
    O,
    P,
    LeftBracket,
    RightBracket,
    Enter,
    LeftControl,
    A,
    S,
    D,
    F,
    G,
    H,
    J,
    K,
    L,
    Semicolon,
    Apostrophe,
    Grave,
    LeftShift,
    Backslash,
    Z,
    X,
    C,
    V,
    B,
    N,
    M,
    Comma,
    Period,
    Slash,
    RightShift,
    KeypadMultiply,
    LeftAlt,
    Space,
    CapsLock,
    Up,
    Down,
    Left,
    Right,
}

/// One entry in the kernel input queue.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct InputEvent {
    pub ty: InputEventType,
    pub body: InputEventBody,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEventType {
    Key,
    Mouse,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union InputEventBody {
    pub key: KeyEvent,
    pub mouse: MouseEvent,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KeyEvent {
    pub code: Scancode,
    /// True if the key was down before this event.
    pub prev_pressed: bool,
    pub pressed: bool,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MouseEvent {
    pub dx: i16,
    pub dy: i16,
    pub left_pressed: bool,
    pub right_pressed: bool,
    pub middle_pressed: bool,
}

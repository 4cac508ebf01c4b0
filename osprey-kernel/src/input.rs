//! Kernel input-event queue and the PS/2 keyboard behind it.
//!
//! Devices push `InputEvent`s into a bounded queue; `PollEvent` pops
//! them, blocking with a timeout. Only set-1 scancodes from the PS/2
//! keyboard feed the queue today.

use alloc::collections::VecDeque;

use osprey_abi::input::{InputEvent, InputEventBody, InputEventType, KeyEvent, Scancode};
use spinning_top::Spinlock;
use x86_64::instructions::port::Port;

use crate::sched::event::Event;

const QUEUE_CAP: usize = 128;

static QUEUE: Spinlock<VecDeque<InputEvent>> = Spinlock::new(VecDeque::new());
static QUEUE_EVENT: Event = Event::new();
static KEY_STATE: Spinlock<[bool; 128]> = Spinlock::new([false; 128]);

/// Push one event, dropping the oldest when full. Called from the
/// keyboard IRQ chain; the queue's capacity is reserved up front so
/// this never allocates.
pub fn push_event(event: InputEvent) {
    {
        let _irq = crate::irq_guard::IrqGuard::new();
        let mut queue = QUEUE.lock();
        if queue.len() >= QUEUE_CAP {
            queue.pop_front();
        }
        queue.push_back(event);
    }
    QUEUE_EVENT.signal_one();
}

fn pop_event() -> Option<InputEvent> {
    let _irq = crate::irq_guard::IrqGuard::new();
    QUEUE.lock().pop_front()
}

/// Pop the next event, waiting up to `timeout_ns` (0 = forever).
/// Returns `None` on timeout.
pub fn poll_event(timeout_ns: u64) -> Option<InputEvent> {
    loop {
        if let Some(event) = pop_event() {
            return Some(event);
        }
        if timeout_ns == 0 {
            QUEUE_EVENT.wait();
        } else if !QUEUE_EVENT.wait_with_timeout(timeout_ns / 1000) {
            return pop_event();
        }
    }
}

/// Map a set-1 make code to a physical key.
fn scancode_from_set1(code: u8) -> Scancode {
    use Scancode::*;
    const TABLE: [Scancode; 59] = [
        Unknown, Escape, Num1, Num2, Num3, Num4, Num5, Num6, Num7, Num8, Num9, Num0, Minus,
        Equals, Backspace, Tab, Q, W, E, R, T, Y, U, I, O, P, LeftBracket, RightBracket, Enter,
        LeftControl, A, S, D, F, G, H, J, K, L, Semicolon, Apostrophe, Grave, LeftShift,
        Backslash, Z, X, C, V, B, N, M, Comma, Period, Slash, RightShift, KeypadMultiply,
        LeftAlt, Space, CapsLock,
    ];
    TABLE.get(code as usize).copied().unwrap_or(Unknown)
}

/// Initialize the PS/2 keyboard: route IRQ 1 and enable scanning.
pub fn init() {
    QUEUE.lock().reserve(QUEUE_CAP);

    let Some(vector) = crate::interrupts::alloc_vector(false) else {
        log::warn!("input: no vector for the PS/2 keyboard");
        return;
    };
    crate::interrupts::register_irq_handler(
        vector,
        alloc::boxed::Box::new(|_frame| {
            let status: u8 = unsafe { Port::new(0x64).read() };
            if status & 1 == 0 {
                return false;
            }
            let raw: u8 = unsafe { Port::new(0x60).read() };
            handle_scancode(raw);
            true
        }),
    );
    crate::apic::ioapic::route_isa_irq(1, vector);
    log::debug!("input: PS/2 keyboard on vector {vector:#x}");
}

fn handle_scancode(raw: u8) {
    // Extended prefix (cursor keys etc.) is dropped for now; a concrete
    // followup exists once the compositor consumes them.
    if raw == 0xe0 {
        return;
    }
    let released = raw & 0x80 != 0;
    let code = scancode_from_set1(raw & 0x7f);
    if code == Scancode::Unknown {
        return;
    }

    let prev_pressed = {
        let mut state = KEY_STATE.lock();
        let prev = state[(raw & 0x7f) as usize];
        state[(raw & 0x7f) as usize] = !released;
        prev
    };

    push_event(InputEvent {
        ty: InputEventType::Key,
        body: InputEventBody {
            key: KeyEvent {
                code,
                prev_pressed,
                pressed: !released,
            },
        },
    });
}

//! State machines guarding order, inventory, and event-processing
//! transitions. The order and inventory machines are validators: the
//! authoritative state lives in the database, and every ledger mutation
//! also encodes its precondition in the SQL `WHERE` clause.

use std::fmt;
use std::sync::Mutex;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Pending,
    Paid,
    Fulfilled,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEvent {
    Pay,
    Cancel,
    Fulfill,
}

impl OrderState {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderState::Pending => "pending",
            OrderState::Paid => "paid",
            OrderState::Fulfilled => "fulfilled",
            OrderState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<OrderState> {
        match s {
            "pending" => Some(OrderState::Pending),
            "paid" => Some(OrderState::Paid),
            "fulfilled" => Some(OrderState::Fulfilled),
            "cancelled" => Some(OrderState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderState::Fulfilled | OrderState::Cancelled)
    }

    /// Returns the successor state, or `InvalidStateTransition` if the
    /// event is not admissible from this state.
    pub fn apply(self, event: OrderEvent) -> Result<OrderState, Error> {
        match (self, event) {
            (OrderState::Pending, OrderEvent::Pay) => Ok(OrderState::Paid),
            (OrderState::Pending, OrderEvent::Cancel) => Ok(OrderState::Cancelled),
            (OrderState::Paid, OrderEvent::Fulfill) => Ok(OrderState::Fulfilled),
            (from, event) => Err(Error::InvalidStateTransition(format!(
                "{event} not allowed from {from}"
            ))),
        }
    }

    pub fn can(self, event: OrderEvent) -> bool {
        self.apply(event).is_ok()
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for OrderEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderEvent::Pay => "pay",
            OrderEvent::Cancel => "cancel",
            OrderEvent::Fulfill => "fulfill",
        };
        f.write_str(s)
    }
}

/// Maps a `(from, to)` status pair back to the event that produces it.
/// Pairs with no mapping (e.g. pending -> fulfilled) are invalid.
pub fn infer_order_event(from: OrderState, to: OrderState) -> Option<OrderEvent> {
    match (from, to) {
        (OrderState::Pending, OrderState::Paid) => Some(OrderEvent::Pay),
        (OrderState::Pending, OrderState::Cancelled) => Some(OrderEvent::Cancel),
        (OrderState::Paid, OrderState::Fulfilled) => Some(OrderEvent::Fulfill),
        _ => None,
    }
}

/// Inventory lifecycle phase of the eggs backing an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryPhase {
    Available,
    Reserved,
    Consumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryEvent {
    Reserve,
    Restore,
    Consume,
}

impl From<OrderState> for InventoryPhase {
    fn from(state: OrderState) -> Self {
        match state {
            OrderState::Pending | OrderState::Paid => InventoryPhase::Reserved,
            OrderState::Fulfilled => InventoryPhase::Consumed,
            OrderState::Cancelled => InventoryPhase::Available,
        }
    }
}

impl InventoryPhase {
    pub fn can(self, event: InventoryEvent) -> bool {
        matches!(
            (self, event),
            (InventoryPhase::Available, InventoryEvent::Reserve)
                | (InventoryPhase::Reserved, InventoryEvent::Restore)
                | (InventoryPhase::Reserved, InventoryEvent::Consume)
        )
    }
}

/// May the inventory reserved for an order in `state` be restored?
pub fn can_restore(state: OrderState) -> bool {
    InventoryPhase::from(state).can(InventoryEvent::Restore)
}

/// May the inventory reserved for an order in `state` be consumed?
pub fn can_consume(state: OrderState) -> bool {
    InventoryPhase::from(state).can(InventoryEvent::Consume)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Idle,
    ProcessingDm,
    ProcessingZap,
    SendingResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorEvent {
    DmReceived,
    ZapReceived,
    CommandProcessed,
    ResponseSent,
    Error,
}

impl fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessorState::Idle => "idle",
            ProcessorState::ProcessingDm => "processing_dm",
            ProcessorState::ProcessingZap => "processing_zap",
            ProcessorState::SendingResponse => "sending_response",
        };
        f.write_str(s)
    }
}

impl fmt::Display for ProcessorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessorEvent::DmReceived => "dm_received",
            ProcessorEvent::ZapReceived => "zap_received",
            ProcessorEvent::CommandProcessed => "command_processed",
            ProcessorEvent::ResponseSent => "response_sent",
            ProcessorEvent::Error => "error",
        };
        f.write_str(s)
    }
}

/// Tracks which phase of event handling the dispatch loop is in. The
/// loop forcibly resets to idle after every terminal or error path.
pub struct ProcessorFsm {
    state: Mutex<ProcessorState>,
}

impl ProcessorFsm {
    pub fn new() -> Self {
        ProcessorFsm {
            state: Mutex::new(ProcessorState::Idle),
        }
    }

    pub fn current(&self) -> ProcessorState {
        *self.state.lock().expect("processor fsm lock poisoned")
    }

    /// Applies an event, returning the new state or refusing with
    /// `InvalidStateTransition`.
    pub fn on_event(&self, event: ProcessorEvent) -> Result<ProcessorState, Error> {
        let mut state = self.state.lock().expect("processor fsm lock poisoned");
        let next = match (*state, event) {
            (ProcessorState::Idle, ProcessorEvent::DmReceived) => ProcessorState::ProcessingDm,
            (ProcessorState::Idle, ProcessorEvent::ZapReceived) => ProcessorState::ProcessingZap,
            (ProcessorState::ProcessingDm, ProcessorEvent::CommandProcessed) => {
                ProcessorState::SendingResponse
            }
            (ProcessorState::SendingResponse | ProcessorState::ProcessingZap, ProcessorEvent::ResponseSent) => {
                ProcessorState::Idle
            }
            (
                ProcessorState::ProcessingDm
                | ProcessorState::ProcessingZap
                | ProcessorState::SendingResponse,
                ProcessorEvent::Error,
            ) => ProcessorState::Idle,
            (from, event) => {
                return Err(Error::InvalidStateTransition(format!(
                    "{event} not allowed from {from}"
                )))
            }
        };
        *state = next;
        Ok(next)
    }

    pub fn reset(&self) {
        *self.state.lock().expect("processor fsm lock poisoned") = ProcessorState::Idle;
    }
}

impl Default for ProcessorFsm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn order_happy_path() {
        let paid = OrderState::Pending.apply(OrderEvent::Pay).unwrap();
        assert_eq!(paid, OrderState::Paid);
        let fulfilled = paid.apply(OrderEvent::Fulfill).unwrap();
        assert_eq!(fulfilled, OrderState::Fulfilled);
        assert!(fulfilled.is_terminal());
    }

    #[test]
    fn order_cancel_only_from_pending() {
        assert!(OrderState::Pending.can(OrderEvent::Cancel));
        assert!(!OrderState::Paid.can(OrderEvent::Cancel));
        assert!(!OrderState::Fulfilled.can(OrderEvent::Cancel));
        assert!(!OrderState::Cancelled.can(OrderEvent::Cancel));
    }

    #[test]
    fn order_no_direct_fulfill_from_pending() {
        assert!(OrderState::Pending.apply(OrderEvent::Fulfill).is_err());
    }

    #[test]
    fn terminal_states_admit_nothing() {
        for state in [OrderState::Fulfilled, OrderState::Cancelled] {
            for event in [OrderEvent::Pay, OrderEvent::Cancel, OrderEvent::Fulfill] {
                assert!(state.apply(event).is_err(), "{state} must reject {event}");
            }
        }
    }

    #[test]
    fn infer_event_covers_valid_pairs_only() {
        assert_eq!(
            infer_order_event(OrderState::Pending, OrderState::Paid),
            Some(OrderEvent::Pay)
        );
        assert_eq!(
            infer_order_event(OrderState::Pending, OrderState::Cancelled),
            Some(OrderEvent::Cancel)
        );
        assert_eq!(
            infer_order_event(OrderState::Paid, OrderState::Fulfilled),
            Some(OrderEvent::Fulfill)
        );
        assert_eq!(infer_order_event(OrderState::Pending, OrderState::Fulfilled), None);
        assert_eq!(infer_order_event(OrderState::Paid, OrderState::Cancelled), None);
    }

    #[test]
    fn inventory_restore_tracks_order_state() {
        assert!(can_restore(OrderState::Pending));
        assert!(can_restore(OrderState::Paid));
        assert!(!can_restore(OrderState::Fulfilled));
        assert!(!can_restore(OrderState::Cancelled));
    }

    #[test]
    fn inventory_consume_requires_reserved() {
        assert!(can_consume(OrderState::Paid));
        assert!(can_consume(OrderState::Pending));
        assert!(!can_consume(OrderState::Fulfilled));
        assert!(!can_consume(OrderState::Cancelled));
    }

    #[test]
    fn processor_dm_cycle() {
        let fsm = ProcessorFsm::new();
        assert_eq!(fsm.current(), ProcessorState::Idle);
        fsm.on_event(ProcessorEvent::DmReceived).unwrap();
        assert_eq!(fsm.current(), ProcessorState::ProcessingDm);
        fsm.on_event(ProcessorEvent::CommandProcessed).unwrap();
        assert_eq!(fsm.current(), ProcessorState::SendingResponse);
        fsm.on_event(ProcessorEvent::ResponseSent).unwrap();
        assert_eq!(fsm.current(), ProcessorState::Idle);
    }

    #[test]
    fn processor_zap_cycle() {
        let fsm = ProcessorFsm::new();
        fsm.on_event(ProcessorEvent::ZapReceived).unwrap();
        assert_eq!(fsm.current(), ProcessorState::ProcessingZap);
        fsm.on_event(ProcessorEvent::ResponseSent).unwrap();
        assert_eq!(fsm.current(), ProcessorState::Idle);
    }

    #[test]
    fn processor_refuses_event_while_busy() {
        let fsm = ProcessorFsm::new();
        fsm.on_event(ProcessorEvent::DmReceived).unwrap();
        assert!(fsm.on_event(ProcessorEvent::DmReceived).is_err());
        assert!(fsm.on_event(ProcessorEvent::ZapReceived).is_err());
        // State unchanged by the refusals.
        assert_eq!(fsm.current(), ProcessorState::ProcessingDm);
    }

    #[test]
    fn processor_error_returns_to_idle() {
        let fsm = ProcessorFsm::new();
        fsm.on_event(ProcessorEvent::DmReceived).unwrap();
        fsm.on_event(ProcessorEvent::Error).unwrap();
        assert_eq!(fsm.current(), ProcessorState::Idle);

        assert!(fsm.on_event(ProcessorEvent::Error).is_err(), "idle has no error edge");
    }

    #[test]
    fn processor_reset_from_any_state() {
        let fsm = ProcessorFsm::new();
        fsm.on_event(ProcessorEvent::DmReceived).unwrap();
        fsm.on_event(ProcessorEvent::CommandProcessed).unwrap();
        fsm.reset();
        assert_eq!(fsm.current(), ProcessorState::Idle);
    }
}

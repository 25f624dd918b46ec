use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::*;
use crate::geometry::Region;
use crate::panel::BUF_FRAME;

fn meta(id: u64) -> UpdateMeta {
    UpdateMeta {
        ids: vec![id],
        mode: 0,
        region: Region::new(0, 0, 8, 1),
        timing: None,
    }
}

fn frame(tag: u8) -> Frame {
    vec![tag; BUF_FRAME]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Power(bool),
    Write(usize),
    Present { slot: usize, first: bool },
}

#[derive(Clone)]
struct RecordingPanel {
    events: Arc<Mutex<Vec<Event>>>,
    fail_present: bool,
}

impl RecordingPanel {
    fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            fail_present: false,
        }
    }

    fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn wait_for<F: Fn(&[Event]) -> bool>(&self, predicate: F) -> Vec<Event> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let events = self.snapshot();
            if predicate(&events) {
                return events;
            }
            assert!(Instant::now() < deadline, "timed out waiting: {events:?}");
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl PanelIo for RecordingPanel {
    fn set_power(&mut self, on: bool) -> io::Result<()> {
        self.events.lock().unwrap().push(Event::Power(on));
        Ok(())
    }

    fn write_frame(&mut self, slot: usize, _frame: &[u8]) {
        self.events.lock().unwrap().push(Event::Write(slot));
    }

    fn present(&mut self, slot: usize, first: bool) -> io::Result<()> {
        if self.fail_present {
            return Err(io::Error::new(io::ErrorKind::Other, "device gone"));
        }
        self.events
            .lock()
            .unwrap()
            .push(Event::Present { slot, first });
        Ok(())
    }
}

#[test]
fn channel_hands_batches_over_in_order() {
    let channel = FrameChannel::new();
    let mut outgoing = vec![frame(1), frame(2)];
    assert!(channel.send(&mut outgoing, meta(7)));

    let mut incoming = Vec::new();
    match channel.recv(&mut incoming, None) {
        Recv::Ready(meta) => assert_eq!(meta.ids, vec![7]),
        _ => panic!("expected a batch"),
    }
    assert_eq!(incoming.len(), 2);
    assert_eq!(incoming[0][0], 1);
    assert_eq!(incoming[1][0], 2);
    channel.complete();

    // The consumed frames travel back on the next send.
    let mut next = vec![frame(3)];
    assert!(channel.send(&mut next, meta(8)));
    assert_eq!(next.len(), 2);
}

#[test]
fn recv_times_out_when_no_batch_arrives() {
    let channel = FrameChannel::new();
    let mut incoming = Vec::new();
    assert!(matches!(
        channel.recv(&mut incoming, Some(Duration::from_millis(20))),
        Recv::TimedOut
    ));
}

#[test]
fn send_blocks_until_previous_batch_completes() {
    let channel = Arc::new(FrameChannel::new());
    assert!(channel.send(&mut vec![frame(1)], meta(1)));

    let sender = {
        let channel = Arc::clone(&channel);
        thread::spawn(move || channel.send(&mut vec![frame(2)], meta(2)))
    };

    // The second send parks until the consumer releases the slot.
    thread::sleep(Duration::from_millis(30));
    assert!(!sender.is_finished());

    let mut incoming = Vec::new();
    assert!(matches!(channel.recv(&mut incoming, None), Recv::Ready(_)));
    channel.complete();
    assert!(sender.join().unwrap());
}

#[test]
fn stop_unblocks_both_sides() {
    let channel = Arc::new(FrameChannel::new());

    let receiver = {
        let channel = Arc::clone(&channel);
        thread::spawn(move || {
            let mut incoming = Vec::new();
            matches!(channel.recv(&mut incoming, None), Recv::Stopped)
        })
    };
    thread::sleep(Duration::from_millis(20));
    channel.stop_vsync();
    assert!(receiver.join().unwrap());

    channel.stop_generator();
    assert!(!channel.send(&mut vec![frame(1)], meta(1)));
}

#[test]
fn pumper_scans_batches_through_alternating_slots() {
    let shared = Arc::new(Shared::new(None, false));
    let panel = RecordingPanel::new();

    let worker = {
        let pumper = Pumper::new(
            Arc::clone(&shared),
            panel.clone(),
            Duration::from_secs(60),
        );
        thread::spawn(move || pumper.run())
    };

    assert!(shared
        .channel()
        .send(&mut vec![frame(1), frame(2)], meta(1)));
    panel.wait_for(|events| events.len() >= 5);

    assert!(shared.channel().send(&mut vec![frame(3)], meta(2)));
    let events = panel.wait_for(|events| events.len() >= 8);

    assert_eq!(
        events,
        vec![
            Event::Power(true),
            Event::Write(1),
            Event::Present {
                slot: 1,
                first: true
            },
            Event::Write(0),
            Event::Present {
                slot: 0,
                first: false
            },
            Event::Power(true),
            Event::Write(1),
            Event::Present {
                slot: 1,
                first: false
            },
        ]
    );

    shared.channel().stop_vsync();
    worker.join().unwrap();
}

#[test]
fn pumper_blanks_panel_after_idle_timeout() {
    let shared = Arc::new(Shared::new(None, false));
    let panel = RecordingPanel::new();

    let worker = {
        let pumper = Pumper::new(
            Arc::clone(&shared),
            panel.clone(),
            Duration::from_millis(30),
        );
        thread::spawn(move || pumper.run())
    };

    panel.wait_for(|events| events.contains(&Event::Power(false)));

    // The next update powers the panel back up before any frame copy.
    assert!(shared.channel().send(&mut vec![frame(1)], meta(1)));
    let events = panel.wait_for(|events| events.iter().any(|e| matches!(e, Event::Write(_))));

    let blank = events
        .iter()
        .position(|event| *event == Event::Power(false))
        .unwrap();
    let unblank = events[blank..]
        .iter()
        .position(|event| *event == Event::Power(true))
        .unwrap()
        + blank;
    let write = events
        .iter()
        .position(|event| matches!(event, Event::Write(_)))
        .unwrap();
    assert!(unblank < write);

    shared.channel().stop_vsync();
    worker.join().unwrap();
}

#[test]
fn pumper_exits_when_presentation_fails() {
    let shared = Arc::new(Shared::new(None, false));
    let mut panel = RecordingPanel::new();
    panel.fail_present = true;

    let worker = {
        let pumper = Pumper::new(
            Arc::clone(&shared),
            panel.clone(),
            Duration::from_secs(60),
        );
        thread::spawn(move || pumper.run())
    };

    assert!(shared.channel().send(&mut vec![frame(1)], meta(1)));
    worker.join().unwrap();

    // The batch was never acknowledged.
    let events = panel.snapshot();
    assert_eq!(events.last(), Some(&Event::Write(1)));
}

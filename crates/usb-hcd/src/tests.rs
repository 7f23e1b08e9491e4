use std::sync::{Arc, Mutex};
use std::vec::Vec;

use crate::desc::{SbCommand, TokenType};
use crate::regs::*;
use crate::sim::{self, SimRegs};
use crate::*;

const DEV: u8 = 2;

fn config() -> HcdConfig {
    HcdConfig {
        hold_spin_limit: 16,
        unlink_spin_limit: 16,
        command_spin_limit: 16,
        ..HcdConfig::default()
    }
}

fn host() -> UsbHost<SimRegs> {
    let host = UsbHost::attach(SimRegs::new(), config()).unwrap();
    host.alloc_device(DEV).unwrap();
    host
}

#[derive(Debug, Clone)]
struct Done {
    id: UrbId,
    status: Result<()>,
    data: Vec<u8>,
}

#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<Done>>>);

impl Log {
    fn callback(&self) -> UrbCallback {
        let log = self.0.clone();
        callback(move |id, urb| {
            log.lock().unwrap().push(Done {
                id,
                status: urb.status,
                data: urb.data().to_vec(),
            })
        })
    }

    fn take(&self) -> Vec<Done> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

fn epid_of(host: &UsbHost<SimRegs>, device: u8, endpoint: u8, max_packet: u16) -> Epid {
    host.lock()
        .epids
        .lookup(device, endpoint, UsbSpeed::Full, max_packet)
        .expect("endpoint has no row")
}

/// Lets the DMA finish the chain on `epid` and runs both halves.
fn complete(host: &UsbHost<SimRegs>, epid: Epid) {
    sim::finish_chain(&mut host.lock(), epid);
    assert!(host.interrupt());
    host.run_deferred().unwrap();
}

fn attention(host: &UsbHost<SimRegs>, epid: Epid, code: EptError, errors: u8) -> Result<(), Fault> {
    sim::raise_attention(&mut host.lock(), epid, code, errors);
    assert!(host.interrupt());
    host.run_deferred()
}

fn get_descriptor(device: u8) -> Urb {
    Urb::control(UsbPipe::control(device, 8), SetupPacket::new(0x80, 6, 0x0100, 0, 18), &[])
}

fn hub_request(host: &UsbHost<SimRegs>, setup: SetupPacket) -> Done {
    let log = Log::default();
    let urb = Urb::control(UsbPipe::control(0, 8), setup, &[]);
    let id = host.submit(urb, log.callback()).unwrap();
    let mut done = log.take();
    assert_eq!(done.len(), 1);
    let done = done.remove(0);
    assert_eq!(done.id, id);
    done
}

#[test]
fn control_in_delivers_received_data() {
    let host = host();
    let log = Log::default();
    let id = host.submit(get_descriptor(DEV), log.callback()).unwrap();
    let epid = epid_of(&host, DEV, 0, 8);

    {
        let hcd = host.lock();
        assert!(hcd.ctrl_ring.enabled(epid));
        let head = hcd.ctrl_ring.node(epid).sub.unwrap();
        let chain: Vec<_> = hcd.segs.chain(head).into_iter().map(|s| hcd.segs.get(s).unwrap().clone()).collect();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].tt, TokenType::Setup);
        assert_eq!((chain[1].tt, chain[1].sw_len, chain[1].rem), (TokenType::In, 3, 2));
        assert_eq!(chain[2].tt, TokenType::Zout);
        assert!(chain[2].command.contains(SbCommand::EOL | SbCommand::EOT | SbCommand::INTR));
        assert_eq!(
            hcd.regs().last_write(R_DMA_CH8_SUB_CMD(SubChannel::Ctrl)),
            Some(DMA_CMD_START)
        );
    }

    let desc: Vec<u8> = (0..18).collect();
    {
        let mut hcd = host.lock();
        sim::receive(&mut hcd, epid, &desc[..8], false);
        sim::receive(&mut hcd, epid, &desc[8..16], false);
        sim::receive(&mut hcd, epid, &desc[16..], true);
    }
    assert!(!host.rx_interrupt());
    complete(&host, epid);

    let done = log.take();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].id, id);
    assert_eq!(done[0].status, Ok(()));
    assert_eq!(done[0].data, desc);

    let hcd = host.lock();
    assert!(!hcd.epids.in_use(epid));
    assert!(!hcd.regs().ept_row(epid).valid);
    assert!(hcd.segs.is_empty());
}

#[test]
fn control_in_without_end_of_transfer_is_protocol_error() {
    let host = host();
    let log = Log::default();
    host.submit(get_descriptor(DEV), log.callback()).unwrap();
    let epid = epid_of(&host, DEV, 0, 8);

    sim::receive(&mut host.lock(), epid, &[0; 8], false);
    host.rx_interrupt();
    complete(&host, epid);

    let done = log.take();
    assert_eq!(done[0].status, Err(UrbError::Protocol));
    assert!(done[0].data.is_empty());
}

#[test]
fn control_out_reports_sent_length() {
    let host = host();
    let log = Log::default();
    let setup = SetupPacket::new(0x21, 9, 0x0200, 0, 3);
    let urb = Urb::control(UsbPipe::control(DEV, 8), setup, &[1, 2, 3]);
    host.submit(urb, log.callback()).unwrap();
    let epid = epid_of(&host, DEV, 0, 8);

    {
        let hcd = host.lock();
        let head = hcd.ctrl_ring.node(epid).sub.unwrap();
        let kinds: Vec<_> = hcd.segs.chain(head).into_iter().map(|s| hcd.segs.get(s).unwrap().tt).collect();
        assert_eq!(kinds, [TokenType::Setup, TokenType::Out, TokenType::In]);
    }

    complete(&host, epid);
    let done = log.take();
    assert_eq!(done[0].status, Ok(()));
    assert_eq!(done[0].data, [1, 2, 3]);
}

#[test]
fn bulk_requests_complete_in_submission_order() {
    let host = host();
    let log = Log::default();
    let pipe = UsbPipe::bulk_out(DEV, 2, 64);
    let ids: Vec<_> = (0..3u8)
        .map(|i| host.submit(Urb::bulk_out(pipe, &[i; 10]), log.callback()).unwrap())
        .collect();
    let epid = epid_of(&host, DEV, 2, 64);

    for _ in 0..3 {
        {
            let hcd = host.lock();
            // Only the head has a chain linked.
            assert_eq!(hcd.segs.len(), 1);
            assert!(hcd.bulk_ring.enabled(epid));
        }
        complete(&host, epid);
    }

    let done = log.take();
    assert_eq!(done.iter().map(|d| d.id).collect::<Vec<_>>(), ids);
    assert!(done.iter().all(|d| d.status == Ok(()) && d.data.len() == 10));
    assert!(!host.lock().epids.in_use(epid));
}

#[test]
fn stall_fails_request_and_frees_row() {
    let host = host();
    let log = Log::default();
    host.submit(get_descriptor(DEV), log.callback()).unwrap();
    let epid = epid_of(&host, DEV, 0, 8);

    attention(&host, epid, EptError::Stall, 0).unwrap();

    let done = log.take();
    assert_eq!(done[0].status, Err(UrbError::Stall));
    let hcd = host.lock();
    assert!(!hcd.epids.in_use(epid));
    assert!(hcd.segs.is_empty());
    assert_eq!(hcd.fault(), None);
}

#[test]
fn exhausted_retries_are_protocol_errors() {
    let host = host();
    let log = Log::default();
    host.submit(Urb::bulk_out(UsbPipe::bulk_out(DEV, 1, 64), &[0; 4]), log.callback()).unwrap();
    let epid = epid_of(&host, DEV, 1, 64);

    attention(&host, epid, EptError::NoError, EPT_ERROR_COUNT_LIMIT).unwrap();
    assert_eq!(log.take()[0].status, Err(UrbError::Protocol));
}

#[test]
fn bus_error_shuts_the_controller_down() {
    let host = host();
    let log = Log::default();
    host.submit(get_descriptor(DEV), log.callback()).unwrap();
    let epid = epid_of(&host, DEV, 0, 8);

    assert_eq!(attention(&host, epid, EptError::BusError, 0), Err(Fault::BusError(epid)));
    assert_eq!(host.fault(), Some(Fault::BusError(epid)));
    assert_eq!(host.submit(get_descriptor(DEV), log.callback()), Err(UrbError::Shutdown));
    assert_eq!(
        host.lock().regs().last_write(R_USB_COMMAND),
        Some(usb_command(0, PortCommand::Reset, CtrlCommand::HostNoRun))
    );
}

#[test]
fn attention_without_request_is_a_fault() {
    let host = host();
    let epid = Epid::new(5).unwrap();
    let row = EptRow {
        valid: true,
        dev: DEV,
        ..EptRow::default()
    };
    host.lock().regs.set_ept_row(epid, row);
    assert_eq!(attention(&host, epid, EptError::Stall, 0), Err(Fault::OrphanAttention(epid)));
}

#[test]
fn attention_waits_for_hold_to_clear() {
    let host = host();
    let log = Log::default();
    host.submit(get_descriptor(DEV), log.callback()).unwrap();
    let epid = epid_of(&host, DEV, 0, 8);

    // One poll per bottom-half pass: the queued snapshot and the drain.
    host.lock().regs.hold_for(epid, 2);
    attention(&host, epid, EptError::Stall, 0).unwrap();
    assert!(log.take().is_empty());

    host.run_deferred().unwrap();
    assert_eq!(log.take()[0].status, Err(UrbError::Stall));
}

#[test]
fn receive_overrun_is_protocol_error() {
    let host = host();
    let log = Log::default();
    host.submit(Urb::bulk_in(UsbPipe::bulk_in(DEV, 1, 64), 4), log.callback()).unwrap();
    let epid = epid_of(&host, DEV, 1, 64);

    sim::receive(&mut host.lock(), epid, &[0; 8], true);
    host.rx_interrupt();
    complete(&host, epid);
    assert_eq!(log.take()[0].status, Err(UrbError::Protocol));
}

#[test]
fn bulk_toggles_survive_row_reuse() {
    let host = host();
    let log = Log::default();
    let pipe = UsbPipe::bulk_in(DEV, 3, 64);
    host.submit(Urb::bulk_in(pipe, 2), log.callback()).unwrap();
    let epid = epid_of(&host, DEV, 3, 64);

    {
        let mut hcd = host.lock();
        let mut row = hcd.regs().ept_row(epid);
        row.t_in = true;
        hcd.regs.set_ept_row(epid, row);
        sim::receive(&mut hcd, epid, &[7, 7], true);
    }
    host.rx_interrupt();
    complete(&host, epid);
    assert_eq!(log.take()[0].data, [7, 7]);
    assert!(!host.lock().epids.in_use(epid));

    host.submit(Urb::bulk_in(pipe, 2), log.callback()).unwrap();
    let epid = epid_of(&host, DEV, 3, 64);
    let row = host.lock().regs().ept_row(epid);
    assert!(row.t_in);
    assert!(!row.t_out);
}

#[test]
fn rejected_requests() {
    let host = host();
    let log = Log::default();

    let mut iso = Urb::bulk_in(UsbPipe::bulk_in(DEV, 1, 64), 8);
    iso.pipe.transfer_type = UsbTransfer::Isochronous;
    assert_eq!(host.submit(iso, log.callback()), Err(UrbError::Unsupported));

    let bad = Urb::bulk_in(UsbPipe::bulk_in(DEV, 1, 0), 8);
    assert_eq!(host.submit(bad, log.callback()), Err(UrbError::Invalid));
    let bad = Urb::bulk_in(UsbPipe::bulk_in(DEV, 1, 65), 8);
    assert_eq!(host.submit(bad, log.callback()), Err(UrbError::Invalid));

    let nobody = Urb::bulk_in(UsbPipe::bulk_in(9, 1, 64), 8);
    assert_eq!(host.submit(nobody, log.callback()), Err(UrbError::NoDevice));

    // Endpoint 1 busy with bulk cannot take interrupt traffic.
    host.submit(Urb::bulk_in(UsbPipe::bulk_in(DEV, 1, 64), 8), log.callback()).unwrap();
    let intr = Urb::interrupt_in(UsbPipe::interrupt_in(DEV, 1, 64), 8, 8);
    assert_eq!(host.submit(intr, log.callback()), Err(UrbError::Busy));

    assert!(log.take().is_empty());
}

#[test]
fn endpoint_rows_run_out() {
    let host = host();
    host.alloc_device(3).unwrap();
    host.alloc_device(4).unwrap();
    let log = Log::default();

    let endpoints = (1..=15).map(|ep| (DEV, ep)).chain((1..=15).map(|ep| (3, ep))).chain([(4, 1)]);
    for (dev, ep) in endpoints {
        host.submit(Urb::bulk_in(UsbPipe::bulk_in(dev, ep, 64), 8), log.callback()).unwrap();
    }
    let last = Urb::bulk_in(UsbPipe::bulk_in(4, 2, 64), 8);
    assert_eq!(host.submit(last, log.callback()), Err(UrbError::Exhausted));
    assert_eq!(host.lock().epids.count_in_use(), NBR_OF_EPIDS - 1);
}

#[test]
fn unlink_of_queued_request_keeps_order() {
    let host = host();
    let log = Log::default();
    let pipe = UsbPipe::bulk_out(DEV, 2, 64);
    let ids: Vec<_> = (0..3u8)
        .map(|i| host.submit(Urb::bulk_out(pipe, &[i]), log.callback()).unwrap())
        .collect();
    let epid = epid_of(&host, DEV, 2, 64);

    host.unlink(ids[1]).unwrap();
    let done = log.take();
    assert_eq!(done.len(), 1);
    assert_eq!((done[0].id, done[0].status), (ids[1], Err(UrbError::Cancelled)));
    assert_eq!(host.unlink(ids[1]), Err(UrbError::NotFound));

    complete(&host, epid);
    complete(&host, epid);
    let order: Vec<_> = log.take().iter().map(|d| d.id).collect();
    assert_eq!(order, [ids[0], ids[2]]);
}

#[test]
fn unlink_of_active_request_arms_the_next() {
    let host = host();
    let log = Log::default();
    let pipe = UsbPipe::bulk_out(DEV, 2, 64);
    let first = host.submit(Urb::bulk_out(pipe, &[1]), log.callback()).unwrap();
    let second = host.submit(Urb::bulk_out(pipe, &[2]), log.callback()).unwrap();
    let epid = epid_of(&host, DEV, 2, 64);

    host.unlink(first).unwrap();
    assert_eq!(log.take()[0].status, Err(UrbError::Cancelled));
    {
        let hcd = host.lock();
        assert!(hcd.bulk_ring.enabled(epid));
        assert_eq!(hcd.segs.len(), 1);
    }

    host.unlink(second).unwrap();
    assert_eq!(log.take()[0].id, second);
    let hcd = host.lock();
    assert!(!hcd.epids.in_use(epid));
    assert!(hcd.segs.is_empty());
}

#[test]
fn unlink_times_out_while_dma_holds_the_node() {
    let host = host();
    let log = Log::default();
    let id = host.submit(Urb::bulk_out(UsbPipe::bulk_out(DEV, 2, 64), &[1]), log.callback()).unwrap();
    let epid = epid_of(&host, DEV, 2, 64);

    host.lock().regs.poke(R_DMA_CH8_SUB_EP(SubChannel::Bulk), epid.raw() as u32);
    assert_eq!(host.unlink(id), Err(UrbError::Shutdown));
    assert_eq!(host.fault(), Some(Fault::UnlinkTimeout(epid)));
}

#[test]
fn interrupt_in_is_polled_and_reported_per_transfer() {
    let host = host();
    let log = Log::default();
    let pipe = UsbPipe::interrupt_in(DEV, 1, 8);
    let id = host.submit(Urb::interrupt_in(pipe, 8, 100), log.callback()).unwrap();
    let epid = epid_of(&host, DEV, 1, 8);

    {
        let hcd = host.lock();
        assert_eq!(hcd.intr_ring.slots_of(epid), [0, 64]);
        assert!(hcd.epids.slot(epid).really_active);
    }

    let second = Urb::interrupt_in(pipe, 8, 100);
    assert_eq!(host.submit(second, log.callback()), Err(UrbError::Busy));

    for report in [[1, 2, 3], [4, 5, 6]] {
        sim::receive(&mut host.lock(), epid, &report, true);
        assert!(host.rx_interrupt());
        host.run_deferred().unwrap();
        let done = log.take();
        assert_eq!(done.len(), 1);
        assert_eq!((done[0].id, done[0].status), (id, Ok(())));
        assert_eq!(done[0].data, report);
    }

    host.unlink(id).unwrap();
    assert_eq!(log.take()[0].status, Err(UrbError::Cancelled));
    let hcd = host.lock();
    assert!(hcd.intr_ring.slots_of(epid).is_empty());
    assert!(!hcd.epids.in_use(epid));
    assert!(hcd.segs.is_empty());
}

#[test]
fn interrupt_report_spanning_packets_is_assembled() {
    let host = host();
    let log = Log::default();
    host.submit(Urb::interrupt_in(UsbPipe::interrupt_in(DEV, 1, 8), 12, 1), log.callback()).unwrap();
    let epid = epid_of(&host, DEV, 1, 8);
    assert_eq!(host.lock().intr_ring.slots_of(epid).len(), 128);

    {
        let mut hcd = host.lock();
        sim::receive(&mut hcd, epid, &[1; 8], false);
        sim::receive(&mut hcd, epid, &[2; 4], true);
    }
    host.rx_interrupt();
    host.run_deferred().unwrap();
    let done = log.take();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].data, [1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2]);
}

#[test]
fn interrupt_stall_is_reported_and_polling_continues() {
    let host = host();
    let log = Log::default();
    let id = host.submit(Urb::interrupt_in(UsbPipe::interrupt_in(DEV, 1, 8), 8, 32), log.callback()).unwrap();
    let epid = epid_of(&host, DEV, 1, 8);
    {
        let mut hcd = host.lock();
        let mut row = hcd.regs().ept_row(epid);
        row.t_in = true;
        hcd.regs.set_ept_row(epid, row);
    }

    attention(&host, epid, EptError::Stall, 0).unwrap();
    let done = log.take();
    assert_eq!((done[0].id, done[0].status), (id, Err(UrbError::Stall)));

    let hcd = host.lock();
    assert_eq!(hcd.intr_ring.slots_of(epid), [0, 32, 64, 96]);
    assert!(hcd.epids.slot(epid).really_active);
    let row = hcd.regs().ept_row(epid);
    assert!(!row.t_in);
    assert_eq!(row.error_code, EptError::NoError);
}

#[test]
fn interrupt_out_completes_on_each_end_of_transfer() {
    let host = host();
    let log = Log::default();
    let id = host
        .submit(Urb::interrupt_out(UsbPipe::interrupt_out(DEV, 2, 8), &[9, 9], 8), log.callback())
        .unwrap();

    {
        let mut hcd = host.lock();
        hcd.regs.poke(R_USB_FM_NUMBER, 8);
        hcd.regs.raise(UsbIrq::INTR_EOT, 0);
    }
    assert!(host.interrupt());
    host.run_deferred().unwrap();
    let done = log.take();
    assert_eq!(done.len(), 1);
    assert_eq!((done[0].id, done[0].status), (id, Ok(())));
    assert_eq!(done[0].data, [9, 9]);

    // Nothing new polled since frame 8.
    host.lock().regs.raise(UsbIrq::INTR_EOT, 0);
    assert!(host.interrupt());
    host.run_deferred().unwrap();
    assert!(log.take().is_empty());
}

/// Raises one interrupt end-of-transfer at `frame` and returns the ids
/// reported by it.
fn intr_eot_at(host: &UsbHost<SimRegs>, log: &Log, frame: u32) -> Vec<UrbId> {
    {
        let mut hcd = host.lock();
        hcd.regs.poke(R_USB_FM_NUMBER, frame);
        hcd.regs.raise(UsbIrq::INTR_EOT, 0);
    }
    assert!(host.interrupt());
    host.run_deferred().unwrap();
    log.take().into_iter().map(|d| d.id).collect()
}

#[test]
fn interrupt_out_reports_only_endpoints_polled_since_last_report() {
    let host = host();
    let log = Log::default();
    let fast = host
        .submit(Urb::interrupt_out(UsbPipe::interrupt_out(DEV, 2, 8), &[1], 8), log.callback())
        .unwrap();
    let slow = host
        .submit(Urb::interrupt_out(UsbPipe::interrupt_out(DEV, 3, 8), &[2], 128), log.callback())
        .unwrap();

    assert_eq!(intr_eot_at(&host, &log, 10), [fast]);
    assert!(intr_eot_at(&host, &log, 12).is_empty());
    assert_eq!(intr_eot_at(&host, &log, 130), [fast, slow]);
}

#[test]
fn bottom_half_picks_up_received_data_first() {
    let host = host();
    let log = Log::default();
    host.submit(get_descriptor(DEV), log.callback()).unwrap();
    let epid = epid_of(&host, DEV, 0, 8);

    let desc: Vec<u8> = (0..18).collect();
    {
        let mut hcd = host.lock();
        sim::receive(&mut hcd, epid, &desc[..8], false);
        sim::receive(&mut hcd, epid, &desc[8..16], false);
        sim::receive(&mut hcd, epid, &desc[16..], true);
    }
    // The controller interrupt is handled before the receive interrupt.
    complete(&host, epid);

    let done = log.take();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].status, Ok(()));
    assert_eq!(done[0].data, desc);
    assert!(!host.rx_interrupt());
}

#[test]
fn periodic_callback_unlinking_itself_sees_cancellation() {
    let host = Arc::new(host());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let again = host.clone();
    let cb = callback(move |id, urb| {
        record.lock().unwrap().push(urb.status);
        if urb.status.is_ok() {
            again.unlink(id).unwrap();
        }
    });
    host.submit(Urb::interrupt_in(UsbPipe::interrupt_in(DEV, 1, 8), 8, 8), cb).unwrap();
    let epid = epid_of(&host, DEV, 1, 8);

    sim::receive(&mut host.lock(), epid, &[5], true);
    host.rx_interrupt();
    host.run_deferred().unwrap();

    assert_eq!(*seen.lock().unwrap(), [Ok(()), Err(UrbError::Cancelled)]);
    let hcd = host.lock();
    assert!(hcd.parked.is_empty());
    assert!(!hcd.epids.in_use(epid));
}

#[test]
fn oversized_interrupt_report_fails_and_polling_continues() {
    let host = host();
    let log = Log::default();
    let id = host.submit(Urb::interrupt_in(UsbPipe::interrupt_in(DEV, 1, 8), 4, 8), log.callback()).unwrap();
    let epid = epid_of(&host, DEV, 1, 8);

    {
        let mut hcd = host.lock();
        sim::receive(&mut hcd, epid, &[1; 3], false);
        sim::receive(&mut hcd, epid, &[2; 3], false);
    }
    host.rx_interrupt();
    assert!(host.lock().urbs.get(id.0).unwrap().pending.is_empty());

    sim::receive(&mut host.lock(), epid, &[3; 3], true);
    host.rx_interrupt();
    host.run_deferred().unwrap();
    let done = log.take();
    assert_eq!((done[0].id, done[0].status), (id, Err(UrbError::Protocol)));

    sim::receive(&mut host.lock(), epid, &[4, 4], true);
    host.rx_interrupt();
    host.run_deferred().unwrap();
    let done = log.take();
    assert_eq!(done[0].status, Ok(()));
    assert_eq!(done[0].data, [4, 4]);
}

#[test]
fn callbacks_may_resubmit() {
    let host = Arc::new(host());
    let log = Log::default();
    let inner = log.clone();
    let again = host.clone();
    let cb = callback(move |_, urb| {
        if urb.status.is_ok() {
            again.submit(get_descriptor(DEV), inner.callback()).unwrap();
        }
    });
    host.submit(get_descriptor(DEV), cb).unwrap();
    let epid = epid_of(&host, DEV, 0, 8);

    sim::receive(&mut host.lock(), epid, &[0; 8], false);
    sim::receive(&mut host.lock(), epid, &[0; 8], false);
    sim::receive(&mut host.lock(), epid, &[0; 2], true);
    host.rx_interrupt();
    complete(&host, epid);

    // The resubmitted request got the freed row back and is in flight.
    let hcd = host.lock();
    assert!(hcd.ctrl_ring.enabled(epid));
    assert_eq!(hcd.queue_depth(epid), 1);
}

#[test]
fn overflowing_deferred_queue_keeps_attention() {
    let host = host();
    let log = Log::default();
    host.submit(get_descriptor(DEV), log.callback()).unwrap();
    let epid = epid_of(&host, DEV, 0, 8);

    for _ in 0..crate::host::DEFERRED_DEPTH {
        host.lock().regs.raise(UsbIrq::SOF, 0);
        assert!(host.interrupt());
    }
    sim::raise_attention(&mut host.lock(), epid, EptError::Stall, 0);
    assert!(host.interrupt());

    host.run_deferred().unwrap();
    assert_eq!(log.take()[0].status, Err(UrbError::Stall));
}

#[test]
fn frame_number_is_eleven_bits() {
    let host = host();
    host.lock().regs.poke(R_USB_FM_NUMBER, 0x1234);
    assert_eq!(host.frame_number(), 0x234);
}

#[test]
fn root_hub_tracks_connect_change() {
    let host = host();
    {
        let mut hcd = host.lock();
        hcd.regs.set_port(0, PortReg::CONNECTED | PortReg::ENABLED);
        hcd.regs.raise(UsbIrq::PORT_STATUS, 0);
    }
    host.interrupt();
    {
        let mut hcd = host.lock();
        hcd.regs.set_port(0, PortReg::CONNECTED);
        hcd.regs.raise(UsbIrq::PORT_STATUS, 0);
    }
    host.interrupt();

    let status = hub_request(&host, SetupPacket::new(0xa3, 0, 0, 1, 4));
    assert_eq!(status.status, Ok(()));
    // Connected and powered; connection and enable changed.
    assert_eq!(status.data, [0x01, 0x01, 0x03, 0x00]);

    let clear = hub_request(&host, SetupPacket::new(0x23, 1, 16, 1, 0));
    assert_eq!(clear.status, Ok(()));
    let status = hub_request(&host, SetupPacket::new(0xa3, 0, 0, 1, 4));
    assert_eq!(status.data, [0x01, 0x01, 0x02, 0x00]);

    let other = hub_request(&host, SetupPacket::new(0xa3, 0, 0, 2, 4));
    assert_eq!(other.data, [0x00, 0x01, 0x00, 0x00]);
}

#[test]
fn root_hub_status_endpoint_reports_only_changes() {
    let host = host();
    let log = Log::default();
    let urb = Urb::interrupt_in(UsbPipe::interrupt_in(0, 1, 2), 2, 255);
    let id = host.submit(urb, log.callback()).unwrap();

    assert_eq!(host.poll_root_hub(), 255);
    assert!(log.take().is_empty());

    {
        let mut hcd = host.lock();
        hcd.regs.set_port(1, PortReg::CONNECTED);
        hcd.regs.raise(UsbIrq::PORT_STATUS, 0);
    }
    host.interrupt();
    host.poll_root_hub();
    let done = log.take();
    assert_eq!((done[0].id, done[0].status), (id, Ok(())));
    assert_eq!(done[0].data, [0b100]);

    let second = Urb::interrupt_in(UsbPipe::interrupt_in(0, 1, 2), 2, 255);
    assert_eq!(host.submit(second, log.callback()), Err(UrbError::Busy));

    host.unlink(id).unwrap();
    assert_eq!(log.take()[0].status, Err(UrbError::Cancelled));
    assert_eq!(host.unlink(id), Err(UrbError::NotFound));
}

#[test]
fn root_hub_status_interval_follows_request() {
    let host = host();
    let urb = Urb::interrupt_in(UsbPipe::interrupt_in(0, 1, 2), 2, 16);
    host.submit(urb, Log::default().callback()).unwrap();
    assert_eq!(host.poll_root_hub(), 16);
}

#[test]
fn root_hub_descriptors_and_address() {
    let host = host();

    let device = hub_request(&host, SetupPacket::new(0x80, 6, 0x0100, 0, 64));
    assert_eq!(device.data.len(), 18);
    assert_eq!(device.data[..2], [18, 1]);
    assert_eq!(device.data[4], 9);

    let config = hub_request(&host, SetupPacket::new(0x80, 6, 0x0200, 0, 9));
    assert_eq!(config.data, [9, 2, 25, 0, 1, 1, 0, 0xc0, 0]);

    let hub = hub_request(&host, SetupPacket::new(0xa0, 6, 0x2900, 0, 9));
    assert_eq!(hub.data[..3], [9, 0x29, 2]);

    let bad = hub_request(&host, SetupPacket::new(0x80, 6, 0x0700, 0, 9));
    assert_eq!(bad.status, Err(UrbError::Stall));

    let set = hub_request(&host, SetupPacket::new(0x00, 5, 1, 0, 0));
    assert_eq!(set.status, Ok(()));
    assert_eq!(host.lock().roothub.address(), 1);

    // Device 0 is now an ordinary device and needs allocating.
    assert_eq!(host.submit(get_descriptor(0), Log::default().callback()), Err(UrbError::NoDevice));
    let log = Log::default();
    host.submit(get_descriptor(1), log.callback()).unwrap();
    assert_eq!(log.take()[0].data.len(), 18);
}

#[test]
fn root_hub_port_commands() {
    let host = host();
    let reset = hub_request(&host, SetupPacket::new(0x23, 3, 4, 2, 0));
    assert_eq!(reset.status, Ok(()));
    assert_eq!(
        host.lock().regs().last_write(R_USB_COMMAND),
        Some(usb_command(2, PortCommand::Reset, CtrlCommand::HostNop))
    );

    hub_request(&host, SetupPacket::new(0x23, 1, 1, 1, 0));
    assert_eq!(host.lock().regs().last_write(R_USB_PORT1_DISABLE), Some(1));

    hub_request(&host, SetupPacket::new(0x23, 1, 2, 1, 0));
    assert_eq!(
        host.lock().regs().last_write(R_USB_COMMAND),
        Some(usb_command(1, PortCommand::Resume, CtrlCommand::HostNop))
    );

    let bad_port = hub_request(&host, SetupPacket::new(0x23, 3, 4, 3, 0));
    assert_eq!(bad_port.status, Err(UrbError::Stall));

    host.lock().regs.command_busy_polls = 100;
    let stuck = hub_request(&host, SetupPacket::new(0x23, 3, 2, 1, 0));
    assert_eq!(stuck.status, Err(UrbError::Shutdown));
    assert_eq!(host.fault(), Some(Fault::CommandTimeout));
}

#[test]
fn device_addresses() {
    let host = host();
    assert_eq!(host.alloc_device(DEV), Err(UrbError::Busy));
    assert_eq!(host.alloc_device(0), Err(UrbError::Invalid));
    assert_eq!(host.alloc_device(128), Err(UrbError::Invalid));
    host.free_device(DEV).unwrap();
    assert_eq!(host.free_device(DEV), Err(UrbError::NoDevice));
}

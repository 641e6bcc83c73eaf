// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Synchronization Integration Tests
//!
//! Drives critical sections, events, mutexes and semaphores from several
//! guest threads through the kernel32 thunks.

use crate::error::{Fault, KernelError};
use crate::object::Handle;
use crate::sched::ThreadState;
use crate::sync::{CRITICAL_SECTION_SIZE, INFINITE, WAIT_ABANDONED, WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT};
use crate::syscall::{FALSE, TRUE};
use crate::testing::Guest;
use crate::Win32Error;

/// Start a worker thread at a dummy entry point
fn spawn(guest: &mut Guest, parameter: u32) -> Handle {
    let entry = guest.return_site + 0x10;
    let raw = guest.call("CreateThread", &[0, 0, entry, parameter, 0, 0]);
    assert_ne!(raw, 0);
    Handle::from_raw(raw)
}

/// Give up the CPU and expect `next` to be scheduled
fn switch_to(guest: &mut Guest, next: Handle) {
    guest.call_switching("Sleep", &[0]);
    assert_eq!(guest.current_thread(), Some(next));
}

fn thread_state(guest: &Guest, thread: Handle) -> ThreadState {
    guest.kernel.objects().thread(thread).unwrap().state
}

/// ============================================================================
/// Critical sections
/// ============================================================================

#[test]
fn test_critical_section_hand_off() {
    let mut guest = Guest::boot();
    let main = guest.info.thread;
    let cs = guest.alloc(CRITICAL_SECTION_SIZE);
    guest.call("InitializeCriticalSection", &[cs]);
    let worker = spawn(&mut guest, 0);

    assert_eq!(guest.call("EnterCriticalSection", &[cs]), 0);
    let record = guest.kernel.read_critical_section(cs).unwrap();
    assert_eq!(record.owner, main.raw());
    assert_eq!(record.lock_count, 0);
    assert_eq!(record.recursion, 1);

    // The worker contends and blocks; the main thread gets the CPU back
    switch_to(&mut guest, worker);
    guest.call_switching("EnterCriticalSection", &[cs]);
    assert_eq!(guest.current_thread(), Some(main));
    assert_eq!(thread_state(&guest, worker), ThreadState::Blocked);
    assert_eq!(guest.kernel.read_critical_section(cs).unwrap().lock_count, 1);

    // Leaving hands the section straight to the waiter
    guest.call("LeaveCriticalSection", &[cs]);
    let record = guest.kernel.read_critical_section(cs).unwrap();
    assert_eq!(record.owner, worker.raw());
    assert_eq!(record.recursion, 1);
    assert_eq!(record.lock_count, 0);
    assert_eq!(thread_state(&guest, worker), ThreadState::Ready);

    switch_to(&mut guest, worker);
    assert_eq!(guest.kernel.cpu().eip, guest.return_site);
    guest.call("LeaveCriticalSection", &[cs]);
    let record = guest.kernel.read_critical_section(cs).unwrap();
    assert_eq!(record.owner, 0);
    assert_eq!(record.recursion, 0);
    assert_eq!(record.lock_count, -1);
}

#[test]
fn test_critical_section_hands_off_in_arrival_order() {
    let mut guest = Guest::boot();
    let main = guest.info.thread;
    let cs = guest.alloc(CRITICAL_SECTION_SIZE);
    guest.call("InitializeCriticalSection", &[cs]);
    let first = spawn(&mut guest, 1);
    let second = spawn(&mut guest, 2);
    guest.call("EnterCriticalSection", &[cs]);

    switch_to(&mut guest, first);
    guest.call_switching("EnterCriticalSection", &[cs]);
    assert_eq!(guest.current_thread(), Some(second));
    guest.call_switching("EnterCriticalSection", &[cs]);
    assert_eq!(guest.current_thread(), Some(main));
    assert_eq!(guest.kernel.read_critical_section(cs).unwrap().lock_count, 2);

    guest.call("LeaveCriticalSection", &[cs]);
    let record = guest.kernel.read_critical_section(cs).unwrap();
    assert_eq!(record.owner, first.raw());
    assert_eq!(record.recursion, 1);
    assert_eq!(record.lock_count, 1);
    assert_eq!(thread_state(&guest, first), ThreadState::Ready);
    assert_eq!(thread_state(&guest, second), ThreadState::Blocked);

    switch_to(&mut guest, first);
    guest.call("LeaveCriticalSection", &[cs]);
    let record = guest.kernel.read_critical_section(cs).unwrap();
    assert_eq!(record.owner, second.raw());
    assert_eq!(record.lock_count, 0);
    assert_eq!(thread_state(&guest, second), ThreadState::Ready);
}

#[test]
fn test_terminated_waiters_leave_their_queues() {
    let mut guest = Guest::boot();
    let cs = guest.alloc(CRITICAL_SECTION_SIZE);
    guest.call("InitializeCriticalSection", &[cs]);
    let backing = guest.kernel.read_critical_section(cs).unwrap().handle;
    let event = guest.call("CreateEventA", &[0, FALSE, FALSE, 0]);
    let entrant = spawn(&mut guest, 1);
    let waiter = spawn(&mut guest, 2);
    guest.call("EnterCriticalSection", &[cs]);

    switch_to(&mut guest, entrant);
    guest.call_switching("EnterCriticalSection", &[cs]);
    assert_eq!(guest.current_thread(), Some(waiter));
    guest.call_switching("WaitForSingleObject", &[event, INFINITE]);
    assert_eq!(guest.current_thread(), Some(guest.info.thread));
    assert_eq!(guest.kernel.read_critical_section(cs).unwrap().lock_count, 1);

    assert_eq!(guest.call("TerminateThread", &[entrant.raw(), 7]), TRUE);
    assert_eq!(guest.call("TerminateThread", &[waiter.raw(), 7]), TRUE);
    assert_eq!(thread_state(&guest, entrant), ThreadState::Terminated);
    assert_eq!(thread_state(&guest, waiter), ThreadState::Terminated);
    assert_eq!(guest.kernel.read_critical_section(cs).unwrap().lock_count, 0);
    assert!(guest.kernel.objects().wait_object(backing).unwrap().queue.is_empty());
    assert!(guest.kernel.objects().wait_object(Handle::from_raw(event)).unwrap().queue.is_empty());

    // Neither dead thread is handed anything
    guest.call("LeaveCriticalSection", &[cs]);
    let record = guest.kernel.read_critical_section(cs).unwrap();
    assert_eq!(record.owner, 0);
    assert_eq!(record.lock_count, -1);
    guest.call("SetEvent", &[event]);
    assert_eq!(guest.call("WaitForSingleObject", &[event, 0]), WAIT_OBJECT_0);
    assert_eq!(thread_state(&guest, entrant), ThreadState::Terminated);
}

#[test]
fn test_critical_section_recursion() {
    let mut guest = Guest::boot();
    let cs = guest.alloc(CRITICAL_SECTION_SIZE);
    guest.call("InitializeCriticalSection", &[cs]);

    for _ in 0..5 {
        guest.call("EnterCriticalSection", &[cs]);
    }
    let record = guest.kernel.read_critical_section(cs).unwrap();
    assert_eq!(record.recursion, 5);
    assert_eq!(record.lock_count, 4);

    for _ in 0..5 {
        guest.call("LeaveCriticalSection", &[cs]);
    }
    let record = guest.kernel.read_critical_section(cs).unwrap();
    assert_eq!(record.owner, 0);
    assert_eq!(record.recursion, 0);
    assert_eq!(record.lock_count, -1);
}

#[test]
fn test_try_enter_critical_section() {
    let mut guest = Guest::boot();
    let cs = guest.alloc(CRITICAL_SECTION_SIZE);
    guest.call("InitializeCriticalSectionAndSpinCount", &[cs, 4000]);
    assert_eq!(guest.call("SetCriticalSectionSpinCount", &[cs, 100]), 4000);
    let worker = spawn(&mut guest, 0);

    assert_eq!(guest.call("TryEnterCriticalSection", &[cs]), TRUE);
    assert_eq!(guest.call("TryEnterCriticalSection", &[cs]), TRUE);
    switch_to(&mut guest, worker);
    assert_eq!(guest.call("TryEnterCriticalSection", &[cs]), FALSE);

    let record = guest.kernel.read_critical_section(cs).unwrap();
    assert_eq!(record.owner, guest.info.thread.raw());
    assert_eq!(record.recursion, 2);
    assert_eq!(record.lock_count, 1);
}

#[test]
fn test_delete_critical_section_releases_backing() {
    let mut guest = Guest::boot();
    let cs = guest.alloc(CRITICAL_SECTION_SIZE);
    guest.call("InitializeCriticalSection", &[cs]);
    let backing = guest.kernel.read_critical_section(cs).unwrap().handle;
    assert!(guest.kernel.objects().contains(backing));

    guest.call("DeleteCriticalSection", &[cs]);
    assert!(!guest.kernel.objects().contains(backing));
    assert_eq!(guest.read_u32(cs), 0);
}

#[test]
fn test_deleting_a_contended_critical_section_strands_its_entrants() {
    let mut guest = Guest::boot();
    let cs = guest.alloc(CRITICAL_SECTION_SIZE);
    guest.call("InitializeCriticalSection", &[cs]);
    let worker = spawn(&mut guest, 0);
    guest.call("EnterCriticalSection", &[cs]);

    switch_to(&mut guest, worker);
    guest.call_switching("EnterCriticalSection", &[cs]);
    guest.call("DeleteCriticalSection", &[cs]);

    let thread = guest.kernel.objects().thread(worker).unwrap();
    assert_eq!(thread.state, ThreadState::Blocked);
    assert_eq!(thread.wait.map(|wait| wait.object), Some(None));

    match guest.try_call("WaitForSingleObject", &[worker.raw(), INFINITE]) {
        Err(KernelError::Fault(Fault::Deadlock(live))) => assert_eq!(live, 2),
        other => panic!("expected a deadlock, got {:?}", other),
    }
}

#[test]
fn test_uninitialized_critical_section_is_initialized_on_enter() {
    let mut guest = Guest::boot();
    let cs = guest.alloc(CRITICAL_SECTION_SIZE);
    guest.write_u32(cs + 4, u32::MAX);

    guest.call("EnterCriticalSection", &[cs]);
    let record = guest.kernel.read_critical_section(cs).unwrap();
    assert!(guest.kernel.objects().contains(record.handle));
    assert_eq!(record.owner, guest.info.thread.raw());
}

/// ============================================================================
/// Events
/// ============================================================================

#[test]
fn test_auto_reset_event_wakes_in_fifo_order() {
    let mut guest = Guest::boot();
    let main = guest.info.thread;
    let event = guest.call("CreateEventA", &[0, FALSE, FALSE, 0]);
    let first = spawn(&mut guest, 1);
    let second = spawn(&mut guest, 2);

    switch_to(&mut guest, first);
    guest.call_switching("WaitForSingleObject", &[event, INFINITE]);
    assert_eq!(guest.current_thread(), Some(second));
    guest.call_switching("WaitForSingleObject", &[event, INFINITE]);
    assert_eq!(guest.current_thread(), Some(main));

    guest.call("SetEvent", &[event]);
    assert_eq!(thread_state(&guest, first), ThreadState::Ready);
    assert_eq!(thread_state(&guest, second), ThreadState::Blocked);
    assert_eq!(guest.kernel.objects().thread(first).unwrap().regs.eax, WAIT_OBJECT_0);

    guest.call("SetEvent", &[event]);
    assert_eq!(thread_state(&guest, second), ThreadState::Ready);
    assert!(!guest.kernel.objects().wait_object(Handle::from_raw(event)).unwrap().is_signaled());
}

#[test]
fn test_manual_reset_event_releases_everyone() {
    let mut guest = Guest::boot();
    let event = guest.call("CreateEventA", &[0, TRUE, FALSE, 0]);
    let first = spawn(&mut guest, 1);
    let second = spawn(&mut guest, 2);

    switch_to(&mut guest, first);
    guest.call_switching("WaitForSingleObject", &[event, INFINITE]);
    guest.call_switching("WaitForSingleObject", &[event, INFINITE]);

    guest.call("SetEvent", &[event]);
    assert_eq!(thread_state(&guest, first), ThreadState::Ready);
    assert_eq!(thread_state(&guest, second), ThreadState::Ready);
    assert_eq!(guest.call("WaitForSingleObject", &[event, 0]), WAIT_OBJECT_0);

    guest.call("ResetEvent", &[event]);
    assert_eq!(guest.call("WaitForSingleObject", &[event, 0]), WAIT_TIMEOUT);
}

#[test]
fn test_closing_an_event_fails_its_waiters() {
    let mut guest = Guest::boot();
    let event = guest.call("CreateEventA", &[0, FALSE, FALSE, 0]);
    let worker = spawn(&mut guest, 0);

    switch_to(&mut guest, worker);
    guest.call_switching("WaitForSingleObject", &[event, INFINITE]);
    assert_eq!(guest.call("CloseHandle", &[event]), TRUE);

    let thread = guest.kernel.objects().thread(worker).unwrap();
    assert_eq!(thread.state, ThreadState::Ready);
    assert_eq!(thread.regs.eax, WAIT_FAILED);
    assert_eq!(thread.wait, None);

    switch_to(&mut guest, worker);
    assert_eq!(guest.kernel.cpu().eax, WAIT_FAILED);
    assert_eq!(guest.last_error(), Win32Error::InvalidHandle.code());
}

#[test]
fn test_named_event_reopen() {
    let mut guest = Guest::boot();
    let name = guest.string("Global\\ready");
    let event = guest.call("CreateEventA", &[0, TRUE, FALSE, name]);
    assert_eq!(guest.last_error(), Win32Error::Success.code());

    let again = guest.call("CreateEventA", &[0, FALSE, TRUE, name]);
    assert_eq!(again, event);
    assert_eq!(guest.last_error(), Win32Error::AlreadyExists.code());

    assert_eq!(guest.call("OpenEventA", &[0, 0, name]), event);
    assert_eq!(guest.kernel.objects().refs(Handle::from_raw(event)), 3);

    // Same name, different kind
    assert_eq!(guest.call("CreateMutexA", &[0, FALSE, name]), 0);
    assert_eq!(guest.last_error(), Win32Error::InvalidHandle.code());
    assert_eq!(guest.call("OpenMutexA", &[0, 0, name]), 0);

    let missing = guest.string("nobody");
    assert_eq!(guest.call("OpenEventA", &[0, 0, missing]), 0);
    assert_eq!(guest.last_error(), Win32Error::FileNotFound.code());
}

/// ============================================================================
/// Waits and timeouts
/// ============================================================================

#[test]
fn test_wait_times_out_on_the_clock() {
    let mut guest = Guest::boot();
    let event = guest.call("CreateEventA", &[0, FALSE, FALSE, 0]);
    let start = guest.clock.now();

    // Nothing else can run: the kernel idles until the deadline
    assert_eq!(guest.call("WaitForSingleObject", &[event, 50]), WAIT_TIMEOUT);
    assert_eq!(guest.clock.now(), start + 50);
    assert!(guest.kernel.objects().wait_object(Handle::from_raw(event)).unwrap().queue.is_empty());

    let stats = guest.kernel.objects().thread(guest.info.thread).unwrap().stats;
    assert_eq!(stats.timeouts, 1);
}

#[test]
fn test_sleep_advances_the_clock() {
    let mut guest = Guest::boot();
    let start = guest.call("GetTickCount", &[]);
    assert_eq!(guest.call("Sleep", &[250]), 0);
    assert_eq!(guest.call("GetTickCount", &[]), start + 250);
}

#[test]
fn test_zero_timeout_polls() {
    let mut guest = Guest::boot();
    let event = guest.call("CreateEventA", &[0, FALSE, TRUE, 0]);
    assert_eq!(guest.call("WaitForSingleObject", &[event, 0]), WAIT_OBJECT_0);
    assert_eq!(guest.call("WaitForSingleObject", &[event, 0]), WAIT_TIMEOUT);
}

#[test]
fn test_deadlock_is_reported() {
    let mut guest = Guest::boot();
    let event = guest.call("CreateEventA", &[0, FALSE, FALSE, 0]);

    match guest.try_call("WaitForSingleObject", &[event, INFINITE]) {
        Err(KernelError::Fault(Fault::Deadlock(live))) => assert_eq!(live, 1),
        other => panic!("expected a deadlock, got {:?}", other),
    }
}

#[test]
fn test_wait_on_critical_section_backing_fails() {
    let mut guest = Guest::boot();
    let cs = guest.alloc(CRITICAL_SECTION_SIZE);
    guest.call("InitializeCriticalSection", &[cs]);
    let backing = guest.kernel.read_critical_section(cs).unwrap().handle;

    assert_eq!(guest.call("WaitForSingleObject", &[backing.raw(), 0]), WAIT_FAILED);
    assert_eq!(guest.last_error(), Win32Error::InvalidHandle.code());
}

#[test]
fn test_join_thread() {
    let mut guest = Guest::boot();
    let main = guest.info.thread;
    let worker = spawn(&mut guest, 0);

    guest.call_switching("WaitForSingleObject", &[worker.raw(), INFINITE]);
    assert_eq!(guest.current_thread(), Some(worker));
    guest.return_from_entry(7).unwrap();

    assert_eq!(guest.current_thread(), Some(main));
    assert_eq!(guest.kernel.cpu().eax, WAIT_OBJECT_0);
    assert_eq!(guest.kernel.cpu().eip, guest.return_site);
}

/// ============================================================================
/// Mutexes
/// ============================================================================

#[test]
fn test_mutex_recursion_and_ownership() {
    let mut guest = Guest::boot();
    let mutex = guest.call("CreateMutexA", &[0, TRUE, 0]);
    assert_eq!(guest.call("WaitForSingleObject", &[mutex, 0]), WAIT_OBJECT_0);
    let worker = spawn(&mut guest, 0);

    switch_to(&mut guest, worker);
    assert_eq!(guest.call("ReleaseMutex", &[mutex]), FALSE);
    assert_eq!(guest.last_error(), Win32Error::NotOwner.code());
    guest.call_switching("WaitForSingleObject", &[mutex, INFINITE]);

    // Two levels of ownership to drop before the worker gets it
    guest.call("ReleaseMutex", &[mutex]);
    assert_eq!(thread_state(&guest, worker), ThreadState::Blocked);
    guest.call("ReleaseMutex", &[mutex]);
    assert_eq!(thread_state(&guest, worker), ThreadState::Ready);
    assert!(guest.kernel.objects().wait_object(Handle::from_raw(mutex)).unwrap().is_owned_by(worker));
}

#[test]
fn test_abandoned_mutex() {
    let mut guest = Guest::boot();
    let main = guest.info.thread;
    let mutex = guest.call("CreateMutexA", &[0, FALSE, 0]);
    let worker = spawn(&mut guest, 0);

    switch_to(&mut guest, worker);
    assert_eq!(guest.call("WaitForSingleObject", &[mutex, 0]), WAIT_OBJECT_0);
    guest.return_from_entry(0).unwrap();

    assert_eq!(guest.current_thread(), Some(main));
    assert_eq!(guest.call("WaitForSingleObject", &[mutex, 0]), WAIT_ABANDONED);
    assert_eq!(guest.call("WaitForSingleObject", &[mutex, 0]), WAIT_OBJECT_0);
}

/// ============================================================================
/// Semaphores
/// ============================================================================

#[test]
fn test_semaphore_counts() {
    let mut guest = Guest::boot();
    assert_eq!(guest.call("CreateSemaphoreA", &[0, 3, 2, 0]), 0);
    assert_eq!(guest.last_error(), Win32Error::InvalidParameter.code());

    let semaphore = guest.call("CreateSemaphoreA", &[0, 1, 2, 0]);
    assert_eq!(guest.call("WaitForSingleObject", &[semaphore, 0]), WAIT_OBJECT_0);
    assert_eq!(guest.call("WaitForSingleObject", &[semaphore, 0]), WAIT_TIMEOUT);

    let previous = guest.alloc(4);
    assert_eq!(guest.call("ReleaseSemaphore", &[semaphore, 2, previous]), TRUE);
    assert_eq!(guest.read_u32(previous), 0);
    assert_eq!(guest.call("ReleaseSemaphore", &[semaphore, 1, previous]), FALSE);
    assert_eq!(guest.last_error(), Win32Error::TooManyPosts.code());
    assert_eq!(guest.call("ReleaseSemaphore", &[semaphore, 0, 0]), FALSE);
    assert_eq!(guest.last_error(), Win32Error::InvalidParameter.code());
}

#[test]
fn test_semaphore_release_wakes_waiters() {
    let mut guest = Guest::boot();
    let semaphore = guest.call("CreateSemaphoreA", &[0, 0, 4, 0]);
    let first = spawn(&mut guest, 1);
    let second = spawn(&mut guest, 2);

    switch_to(&mut guest, first);
    guest.call_switching("WaitForSingleObject", &[semaphore, INFINITE]);
    guest.call_switching("WaitForSingleObject", &[semaphore, INFINITE]);

    guest.call("ReleaseSemaphore", &[semaphore, 3, 0]);
    assert_eq!(thread_state(&guest, first), ThreadState::Ready);
    assert_eq!(thread_state(&guest, second), ThreadState::Ready);
    assert_eq!(guest.call("WaitForSingleObject", &[semaphore, 0]), WAIT_OBJECT_0);
    assert_eq!(guest.call("WaitForSingleObject", &[semaphore, 0]), WAIT_TIMEOUT);
}

/// ============================================================================
/// Interlocked
/// ============================================================================

#[test]
fn test_interlocked_operations() {
    let mut guest = Guest::boot();
    let cell = guest.alloc(4);

    assert_eq!(guest.call("InterlockedIncrement", &[cell]), 1);
    assert_eq!(guest.call("InterlockedDecrement", &[cell]), 0);
    assert_eq!(guest.call("InterlockedDecrement", &[cell]), u32::MAX);
    assert_eq!(guest.call("InterlockedExchange", &[cell, 10]), u32::MAX);
    assert_eq!(guest.call("InterlockedCompareExchange", &[cell, 20, 11]), 10);
    assert_eq!(guest.read_u32(cell), 10);
    assert_eq!(guest.call("InterlockedCompareExchange", &[cell, 20, 10]), 10);
    assert_eq!(guest.read_u32(cell), 20);
}

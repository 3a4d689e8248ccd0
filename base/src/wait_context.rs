// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::marker::PhantomData;

use smallvec::SmallVec;

use crate::errno_result;
use crate::AsRawDescriptor;
use crate::FromRawDescriptor;
use crate::RawDescriptor;
use crate::Result;
use crate::SafeDescriptor;

/// Trait that can be used to associate events with arbitrary enums when
/// using `WaitContext`. Variants are converted to and from a `u64` token.
pub trait EventToken {
    /// Converts this token into a raw token stored with the event.
    fn as_raw_token(&self) -> u64;

    /// Converts a raw token back into the token type.
    fn from_raw_token(data: u64) -> Self;
}

/// An event that was signaled while waiting.
#[derive(Copy, Clone, Debug)]
pub struct TriggeredEvent<T: EventToken> {
    pub token: T,
    pub is_readable: bool,
    pub is_hungup: bool,
}

/// Waits for readiness on multiple descriptors, built on epoll.
pub struct WaitContext<T: EventToken> {
    epoll: SafeDescriptor,
    tokens: PhantomData<T>,
}

impl<T: EventToken> WaitContext<T> {
    pub fn new() -> Result<WaitContext<T>> {
        // Safe because we verify the result and take ownership.
        let epoll = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll < 0 {
            return errno_result();
        }
        Ok(WaitContext {
            // Safe because the descriptor was just created and is unowned.
            epoll: unsafe { SafeDescriptor::from_raw_descriptor(epoll) },
            tokens: PhantomData,
        })
    }

    /// Builds a context pre-populated with `items`.
    pub fn build_with(items: &[(&dyn AsRawDescriptor, T)]) -> Result<WaitContext<T>> {
        let ctx = WaitContext::new()?;
        for (descriptor, token) in items {
            ctx.add(*descriptor, T::from_raw_token(token.as_raw_token()))?;
        }
        Ok(ctx)
    }

    /// Starts waiting on readability of `descriptor`, associating `token`
    /// with it.
    pub fn add(&self, descriptor: &dyn AsRawDescriptor, token: T) -> Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token.as_raw_token(),
        };
        // Safe because the epoll descriptor is owned and the event struct
        // outlives the call.
        let ret = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_descriptor(),
                libc::EPOLL_CTL_ADD,
                descriptor.as_raw_descriptor(),
                &mut event,
            )
        };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Stops waiting on `descriptor`.
    pub fn delete(&self, descriptor: &dyn AsRawDescriptor) -> Result<()> {
        // Safe because the epoll descriptor is owned; the event argument is
        // ignored for EPOLL_CTL_DEL.
        let ret = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_descriptor(),
                libc::EPOLL_CTL_DEL,
                descriptor.as_raw_descriptor(),
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Blocks until at least one registered event triggers.
    pub fn wait(&self) -> Result<SmallVec<[TriggeredEvent<T>; 16]>> {
        const MAX_EVENTS: usize = 16;
        let mut events: [libc::epoll_event; MAX_EVENTS] =
            // Safe because epoll_event is plain data.
            unsafe { std::mem::zeroed() };
        let ret = loop {
            // Safe because the epoll descriptor is owned and the events
            // buffer lives across the call.
            let ret = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_descriptor(),
                    events.as_mut_ptr(),
                    MAX_EVENTS as i32,
                    -1,
                )
            };
            if ret >= 0 {
                break ret as usize;
            }
            if crate::Error::last().errno() != libc::EINTR {
                return errno_result();
            }
        };
        Ok(events[..ret]
            .iter()
            .map(|e| TriggeredEvent {
                token: T::from_raw_token(e.u64),
                is_readable: e.events & libc::EPOLLIN as u32 != 0,
                is_hungup: e.events & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0,
            })
            .collect())
    }
}

impl<T: EventToken> AsRawDescriptor for WaitContext<T> {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.epoll.as_raw_descriptor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Event;

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    enum Token {
        A,
        B,
    }

    impl EventToken for Token {
        fn as_raw_token(&self) -> u64 {
            match self {
                Token::A => 0,
                Token::B => 1,
            }
        }

        fn from_raw_token(data: u64) -> Self {
            match data {
                0 => Token::A,
                _ => Token::B,
            }
        }
    }

    #[test]
    fn wait_returns_triggered_token() {
        let a = Event::new().unwrap();
        let b = Event::new().unwrap();
        let ctx: WaitContext<Token> =
            WaitContext::build_with(&[(&a, Token::A), (&b, Token::B)]).unwrap();
        b.write(1).unwrap();
        let events = ctx.wait().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, Token::B);
        assert!(events[0].is_readable);
    }
}

// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A small pool of cluster-sized scratch buffers, so the cluster store and
//! the transaction log's restore path don't allocate fresh on every read.
//! Buffers are handed out as RAII guards that return themselves to the
//! free list on drop.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

pub struct ClusterBufferPool {
    buffer_size: usize,
    free_list: Mutex<Vec<Box<[u8]>>>,
}

impl ClusterBufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            free_list: Mutex::new(Vec::new()),
        }
    }

    /// Hands out a zeroed buffer of `buffer_size` bytes, reusing a
    /// previously released one if the free list has one.
    pub fn acquire(&self) -> PooledBuffer<'_> {
        let mut free_list = self.free_list.lock().unwrap();
        let mut buf = free_list
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size].into_boxed_slice());
        buf.fill(0);
        PooledBuffer { pool: self, buf: Some(buf) }
    }
}

pub struct PooledBuffer<'a> {
    pool: &'a ClusterBufferPool,
    buf: Option<Box<[u8]>>,
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap()
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap()
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.free_list.lock().unwrap().push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_buffers_are_reused_instead_of_reallocated() {
        let pool = ClusterBufferPool::new(64);
        {
            let mut buf = pool.acquire();
            buf[0] = 7;
        }
        assert_eq!(pool.free_list.lock().unwrap().len(), 1);

        let buf = pool.acquire();
        assert_eq!(buf.len(), 64);
        assert_eq!(buf[0], 0, "reused buffers must come back zeroed");
    }

    #[test]
    fn concurrent_acquires_each_get_an_independent_buffer() {
        let pool = ClusterBufferPool::new(8);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(a.len(), 8);
        assert_eq!(b.len(), 8);
    }
}

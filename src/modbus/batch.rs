//! Request batching
//!
//! Coalesces per-channel register addresses into as few bus reads as
//! possible. Contiguous and overlapping addresses share one request;
//! a gap or the per-class quantity ceiling closes the current chunk.

use super::RegisterKind;

/// One channel's register window inside a batched read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadAddress {
    /// Channel the registers belong to.
    pub channel: String,
    /// Zero-based register address.
    pub address: u16,
    /// Number of consecutive registers the channel's value occupies.
    pub size: u16,
}

/// A batched read covering one contiguous register range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub kind: RegisterKind,
    pub start: u16,
    pub quantity: u16,
    /// Member addresses, in ascending address order.
    pub addresses: Vec<ReadAddress>,
}

impl ReadRequest {
    /// Register offset of a member address inside the response window.
    pub fn offset(&self, address: u16) -> usize {
        usize::from(address - self.start)
    }
}

/// Split a set of addresses of one register class into batched reads.
///
/// Addresses are sorted ascending first. A chunk is closed when its
/// quantity reaches the class ceiling or the next address leaves a gap;
/// overlapping addresses fold into the current chunk without inflating
/// its quantity.
pub fn split(kind: RegisterKind, mut addresses: Vec<ReadAddress>) -> Vec<ReadRequest> {
    let max_quantity = kind.max_quantity_per_request();

    addresses.sort_by_key(|a| a.address);

    let mut requests = Vec::new();
    let mut members: Vec<ReadAddress> = Vec::new();
    let mut start: u16 = 0;
    let mut end: u32 = 0;

    for address in addresses {
        if !members.is_empty() {
            let quantity = end - u32::from(start);
            let closed = quantity >= u32::from(max_quantity)
                || u32::from(address.address) > end;

            if closed {
                requests.push(ReadRequest {
                    kind,
                    start,
                    quantity: quantity as u16,
                    addresses: std::mem::take(&mut members),
                });
            }
        }

        if members.is_empty() {
            start = address.address;
            end = u32::from(start);
        }

        end = end.max(u32::from(address.address) + u32::from(address.size));
        members.push(address);
    }

    if !members.is_empty() {
        requests.push(ReadRequest {
            kind,
            start,
            quantity: (end - u32::from(start)) as u16,
            addresses: members,
        });
    }

    requests
}

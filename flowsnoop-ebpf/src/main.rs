#![no_std]
#![no_main]

mod maps;
mod parse;
mod tc;
mod tracepoint;

pub use tc::{tc_egress, tc_ingress};
pub use tracepoint::{net_dev_start_xmit, netif_receive_skb};

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

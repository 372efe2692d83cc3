pub mod packet_io;

pub use packet_io::{write_packet, PacketReader};

pub mod string;
pub mod variable_int;

pub use string::{binary_len, decode_binary, decode_string, encode_binary, encode_string, string_len};
pub use variable_int::{
    decode_variable_int, encode_variable_int, encoded_variable_int_len, peek_variable_int,
    VARIABLE_INT_MAX,
};

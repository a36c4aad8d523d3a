#![cfg(test)]

mod test_utils;
mod transport_test;

//! This module declares all readers.
//! A reader is used to fetch data over the network. The fetchers only
//! build requests and parse responses; sending them is up to a reader.

pub mod http;

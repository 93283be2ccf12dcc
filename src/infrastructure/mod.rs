pub mod smartapi_client;
pub mod smartstream_codec;

mod error;
mod tls;

pub use error::TlsError;
pub use tls::{
    certified_key_from_pem, client_config_from_pem, load_certs_from_pem,
    load_private_key_from_pem,
};

pub const READ_TX_ERR: &str = "Reader stage is gone, dropping connection";
pub const HANDLE_TX_ERR: &str = "Handler stage is gone, dropping request";
pub const RES_TX_ERR: &str = "Responder stage is gone, dropping response";

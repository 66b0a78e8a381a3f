use uuid::Uuid;

/// One request line read from a connection.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub connection_id: Uuid,
    pub line: String,
}

impl Inbound {
    pub fn new(connection_id: Uuid, line: &str) -> Self {
        Self {
            connection_id,
            line: line.to_string(),
        }
    }
}

/// One response line to write back, without the trailing newline.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub connection_id: Uuid,
    pub line: String,
}

impl Outbound {
    pub fn new(connection_id: Uuid, line: String) -> Self {
        Self {
            connection_id,
            line,
        }
    }
}

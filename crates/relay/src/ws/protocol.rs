use axum::extract::ws::{Message, WebSocket};
use parley_common::protocol::ws::ChatFrame;

pub fn decode_message(raw: &str) -> Result<ChatFrame, serde_json::Error> {
    serde_json::from_str::<ChatFrame>(raw)
}

pub fn encode_message(message: &ChatFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

pub async fn send_ws_message(socket: &mut WebSocket, message: &ChatFrame) -> Result<(), ()> {
    let encoded = encode_message(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

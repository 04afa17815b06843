// huntart-common: wire protocol types shared by the chat gateway and its clients.

pub mod protocol;

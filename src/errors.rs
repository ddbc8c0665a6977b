error_chain! {
    foreign_links {
        Io(::std::io::Error);
        AddrParse(::std::net::AddrParseError);
        HttpParse(::httparse::Error);
        Http(::http::Error);
        Utf8(::std::str::Utf8Error);
        Json(::serde_json::Error);
    }
    errors {
        AddressInUse(addr: String) {
            description("address already in use")
            display("address already in use: {}", addr)
        }
        InvalidContentLength(value: String) {
            description("invalid content-length header")
            display("invalid content-length header: {:?}", value)
        }
        RequestHeadTooLarge(len: usize) {
            description("request head too large")
            display("request head exceeds limit after {} bytes", len)
        }
    }
}

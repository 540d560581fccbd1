use std::hint::black_box;
use bencher::ResponseCase;
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use micro_client::codec::{ChunkedEncoder, ResponseDecoder};
use micro_client::protocol::{Message, PayloadItem};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const SMALL_RESPONSE: &str = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
const LARGE_RESPONSE: &str = concat!(
    "HTTP/1.1 200 OK\r\n",
    "Date: Tue, 14 Oct 2025 08:12:31 GMT\r\n",
    "Content-Type: text/html; charset=utf-8\r\n",
    "Cache-Control: private, max-age=0, must-revalidate\r\n",
    "Vary: Accept-Encoding, Accept-Language, Cookie\r\n",
    "Set-Cookie: session=4b1e2a96c7d84f0f9a3b7e1c5d2f8a60; Path=/; HttpOnly; Secure; SameSite=Lax\r\n",
    "Set-Cookie: locale=en-US; Path=/; Max-Age=31536000\r\n",
    "Strict-Transport-Security: max-age=63072000; includeSubDomains; preload\r\n",
    "Content-Security-Policy: default-src 'self'; img-src 'self' data: https:; script-src 'self'\r\n",
    "X-Content-Type-Options: nosniff\r\n",
    "X-Frame-Options: DENY\r\n",
    "X-Request-Id: 9f7c1d2e-5a4b-4c3d-8e2f-1a0b9c8d7e6f\r\n",
    "ETag: \"33a64df551425fcc55e4d42a148795d9f25f89d4\"\r\n",
    "Last-Modified: Mon, 13 Oct 2025 21:40:02 GMT\r\n",
    "Server: bench\r\n",
    "Transfer-Encoding: chunked\r\n",
    "\r\n",
    "1a\r\nabcdefghijklmnopqrstuvwxyz\r\n",
    "a\r\n0123456789\r\n",
    "0\r\n\r\n",
);

const HEAD_RESPONSE: &str = "HTTP/1.1 200 OK\r\nContent-Length: 1048576\r\nContent-Type: application/octet-stream\r\n\r\n";

fn create_test_cases() -> Vec<ResponseCase> {
    vec![
        ResponseCase::get("small_response_decoder", SMALL_RESPONSE),
        ResponseCase::get("large_response_decoder", LARGE_RESPONSE),
        ResponseCase::head("head_response_decoder", HEAD_RESPONSE),
    ]
}

fn benchmark_response_decoder(criterion: &mut Criterion) {
    let test_cases = create_test_cases();
    let mut group = criterion.benchmark_group("response_decoder");

    for case in test_cases {
        group.throughput(Throughput::Bytes(case.content().len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(case.name()), &case, |b, case| {
            let mut response_decoder = ResponseDecoder::new(8 * 1024, 16);
            b.iter_batched_ref(
                || BytesMut::from(case.content()),
                |bytes_mut| {
                    response_decoder.expect_response_to(case.method().clone());
                    loop {
                        let message = response_decoder.decode(bytes_mut).expect("input should be a valid http response").unwrap();
                        let eof = matches!(&message, Message::Payload(item) if item.is_eof());
                        black_box(message);
                        if eof {
                            break;
                        }
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn benchmark_chunked_round_trip(criterion: &mut Criterion) {
    let chunk = Bytes::from(vec![b'x'; 16 * 1024]);
    let mut group = criterion.benchmark_group("chunked_round_trip");
    group.throughput(Throughput::Bytes(chunk.len() as u64 * 8));

    group.bench_function("encode_then_decode_8_chunks", |b| {
        b.iter(|| {
            let mut encoder = ChunkedEncoder::new();
            let mut wire = BytesMut::from("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
            for _ in 0..8 {
                encoder.encode(PayloadItem::Chunk(chunk.clone()), &mut wire).expect("chunk should encode");
            }
            encoder.encode(PayloadItem::<Bytes>::Eof, &mut wire).expect("terminator should encode");

            let mut decoder = ResponseDecoder::new(8 * 1024, 16);
            let mut received = 0;
            while let Some(message) = decoder.decode(&mut wire).expect("input should be a valid chunked response") {
                match message {
                    Message::Payload(PayloadItem::Chunk(bytes)) => received += bytes.len(),
                    Message::Payload(PayloadItem::Eof) => break,
                    Message::Header(header) => {
                        black_box(header);
                    }
                }
            }
            black_box(received);
        });
    });

    group.finish();
}

criterion_group!(decoder, benchmark_response_decoder, benchmark_chunked_round_trip);
criterion_main!(decoder);

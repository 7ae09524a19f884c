use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use rivet::buffer::Buffer;
use rivet::http::request::HttpRequest;
use rivet::pool::{ConnPool, MemoryStore};

const REQ: &[u8] = b"\
GET / HTTP/1.1\r\n\
Host: www.example.org\r\n\r\n";

const REQ_MED: &[u8] = b"\
GET /picture HTTP/1.1\r\n\
Accept: */*\r\n\
Accept-Encoding: gzip,deflate,br\r\n\
Accept-Language: en-US,en;q=0.5\r\n\
Cache-Control: no-cache\r\n\
Connection: keep-alive\r\n\
Host: www.example.org\r\n\
Pragma: no-cache\r\n\
User-Agent: Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/109.0\r\n\r\n";

const REQ_POST: &[u8] = b"\
POST /login.html HTTP/1.1\r\n\
Host: www.example.org\r\n\
Content-Type: application/x-www-form-urlencoded\r\n\
Content-Length: 30\r\n\
Connection: keep-alive\r\n\r\n\
username=alice&password=s3cret";

fn benchmark(c: &mut Criterion) {
    let users = ConnPool::new(MemoryStore::shared(1));
    let inputs = [("small", REQ), ("medium", REQ_MED), ("post", REQ_POST)];

    let mut group = c.benchmark_group("parse");
    for (name, input) in inputs.iter() {
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), input, |b, &input| {
            b.iter(|| {
                let mut buf = Buffer::new();
                buf.append(input);
                let mut request = HttpRequest::new();
                request.parse(&mut buf, &users)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark);
criterion_main!(benches);

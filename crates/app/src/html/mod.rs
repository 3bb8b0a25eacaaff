//! Embedded preview page, bundled into the binary.

pub const INDEX_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="UTF-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1.0" />
  <title>RGB-D segmentation preview</title>
  <style>
    body { margin: 0; background: #0b1220; color: #e2e8f0; font-family: ui-sans-serif, system-ui; }
    header { padding: 0.75rem 1rem; border-bottom: 1px solid #1e293b; display: flex; gap: 2rem; }
    main { display: grid; grid-template-columns: repeat(auto-fit, minmax(320px, 1fr)); gap: 1rem; padding: 1rem; }
    figure { margin: 0; background: #111a2e; border-radius: 6px; padding: 0.5rem; }
    figcaption { font-size: 0.85rem; color: #94a3b8; padding-bottom: 0.25rem; }
    img { width: 100%; image-rendering: pixelated; }
    .label { filter: contrast(2000%) hue-rotate(90deg); }
  </style>
</head>
<body>
  <header>
    <strong>seg_rgb</strong>
    <span>frame <span id="frame-id">-</span></span>
    <span>stamp <span id="stamp">-</span></span>
    <span>objects <span id="objects">-</span></span>
    <span>refined <span id="refined">-</span></span>
  </header>
  <main>
    <figure><figcaption>seg_image (live)</figcaption><img src="/stream.mjpg" alt="overlay stream" /></figure>
    <figure><figcaption>seg_image_refined</figcaption><img data-topic="seg_image_refined" alt="" /></figure>
    <figure><figcaption>seg_label</figcaption><img class="label" data-topic="seg_label" alt="" /></figure>
    <figure><figcaption>seg_label_refined</figcaption><img class="label" data-topic="seg_label_refined" alt="" /></figure>
  </main>
  <script>
    const show = (id, value) => { document.getElementById(id).textContent = value ?? "-"; };
    async function refresh() {
      try {
        const status = await (await fetch("/status")).json();
        show("frame-id", status.frame_id);
        show("stamp", status.stamp_ns);
        show("objects", status.objects);
        show("refined", status.refined_objects);
        for (const img of document.querySelectorAll("img[data-topic]")) {
          img.src = `/${img.dataset.topic}.png?frame=${status.frames}`;
        }
      } catch (_) {}
    }
    setInterval(refresh, 500);
    refresh();
  </script>
</body>
</html>
"#;
